//! # Analysis Configuration
//!
//! A single immutable [`AnalysisConfig`] is threaded through every stage call.
//! It is the only source of thresholds, tolerances and seeds; nothing in the
//! engine reads global state. Configurations are loaded from TOML, where every
//! key is optional and falls back to the documented default.

use crate::types::Covariate;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Weighting used when fitting the Moses-Littenberg line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SrocWeighting {
    /// Ordinary least squares.
    Unweighted,
    /// Weights equal to the inverse sampling variance of the log DOR.
    InverseVariance,
}

/// Every tunable of the analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AnalysisConfig {
    /// Two-sided coverage of every reported interval.
    pub confidence_level: f64,
    /// Added to all four cells of a study that has a zero cell.
    pub continuity_correction: f64,
    pub min_studies_pooling: usize,
    pub min_studies_meta_regression: usize,
    pub min_studies_bias_test: usize,
    /// Below this many studies an SROC curve is marked unreliable.
    pub min_studies_reliable_sroc: usize,
    /// Absolute shift in pooled sensitivity or specificity (as a proportion)
    /// that marks a study as influential in the leave-one-out analysis.
    pub influence_threshold: f64,
    pub reml_tolerance: f64,
    pub reml_max_iterations: usize,
    pub bootstrap_replicates: usize,
    pub bootstrap_seed: u64,
    /// Significance level of Deeks' asymmetry test.
    pub bias_significance: f64,
    pub sroc_weighting: SrocWeighting,
    pub subgroup_covariates: Vec<Covariate>,
    pub regression_covariates: Vec<Covariate>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            confidence_level: 0.95,
            continuity_correction: 0.5,
            min_studies_pooling: 3,
            min_studies_meta_regression: 5,
            min_studies_bias_test: 10,
            min_studies_reliable_sroc: 4,
            influence_threshold: 0.05,
            reml_tolerance: 1e-6,
            reml_max_iterations: 100,
            bootstrap_replicates: 1000,
            bootstrap_seed: 0x5EED_D7A0,
            bias_significance: 0.10,
            sroc_weighting: SrocWeighting::Unweighted,
            subgroup_covariates: Covariate::CATEGORICAL.to_vec(),
            regression_covariates: Covariate::ALL.to_vec(),
        }
    }
}

/// A configuration that cannot describe a meaningful analysis. This is the
/// only error class that stops a whole run.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML configuration: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Configuration value '{field}' = {value} is invalid: {reason}")]
    InvalidValue {
        field: &'static str,
        value: String,
        reason: &'static str,
    },
}

impl AnalysisConfig {
    /// Loads and validates a configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: AnalysisConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects thresholds that no analysis could satisfy.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(
            field: &'static str,
            value: impl ToString,
            reason: &'static str,
        ) -> Result<(), ConfigError> {
            Err(ConfigError::InvalidValue {
                field,
                value: value.to_string(),
                reason,
            })
        }

        if !(self.confidence_level > 0.0 && self.confidence_level < 1.0) {
            return invalid(
                "confidence_level",
                self.confidence_level,
                "must lie strictly between 0 and 1",
            );
        }
        if !(self.continuity_correction.is_finite() && self.continuity_correction > 0.0) {
            return invalid(
                "continuity_correction",
                self.continuity_correction,
                "must be a positive finite number",
            );
        }
        if self.min_studies_pooling < 2 {
            return invalid(
                "min_studies_pooling",
                self.min_studies_pooling,
                "pooling needs at least 2 studies",
            );
        }
        if self.min_studies_meta_regression < 3 {
            return invalid(
                "min_studies_meta_regression",
                self.min_studies_meta_regression,
                "a regression with one covariate needs at least 3 studies",
            );
        }
        if self.min_studies_bias_test < 3 {
            return invalid(
                "min_studies_bias_test",
                self.min_studies_bias_test,
                "the asymmetry regression needs at least 3 studies",
            );
        }
        if !(self.influence_threshold > 0.0 && self.influence_threshold < 1.0) {
            return invalid(
                "influence_threshold",
                self.influence_threshold,
                "must lie strictly between 0 and 1",
            );
        }
        if !(self.reml_tolerance.is_finite() && self.reml_tolerance > 0.0) {
            return invalid(
                "reml_tolerance",
                self.reml_tolerance,
                "must be a positive finite number",
            );
        }
        if self.reml_max_iterations == 0 {
            return invalid(
                "reml_max_iterations",
                self.reml_max_iterations,
                "at least one iteration is required",
            );
        }
        if !(self.bias_significance > 0.0 && self.bias_significance < 1.0) {
            return invalid(
                "bias_significance",
                self.bias_significance,
                "must lie strictly between 0 and 1",
            );
        }
        if let Some(covariate) = self
            .subgroup_covariates
            .iter()
            .find(|c| !c.is_categorical())
        {
            return invalid(
                "subgroup_covariates",
                covariate,
                "subgroups can only be formed from categorical covariates",
            );
        }
        Ok(())
    }

    /// The two-sided standard normal critical value for `confidence_level`.
    pub fn z_critical(&self) -> f64 {
        crate::dist::normal_quantile(0.5 + self.confidence_level / 2.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn defaults_are_valid_and_match_documented_values() {
        let config = AnalysisConfig::default();
        config.validate().unwrap();
        assert_eq!(config.min_studies_pooling, 3);
        assert_eq!(config.min_studies_meta_regression, 5);
        assert_eq!(config.min_studies_bias_test, 10);
        assert_eq!(config.reml_max_iterations, 100);
        assert_abs_diff_eq!(config.z_critical(), 1.959964, epsilon = 1e-5);
    }

    #[test]
    fn partial_toml_keeps_defaults_for_missing_keys() {
        let config = AnalysisConfig::from_toml_str(
            "confidence_level = 0.90\ninfluence_threshold = 0.1\nsroc_weighting = \"inverse_variance\"\n",
        )
        .unwrap();
        assert_abs_diff_eq!(config.confidence_level, 0.90);
        assert_abs_diff_eq!(config.influence_threshold, 0.1);
        assert_eq!(config.sroc_weighting, SrocWeighting::InverseVariance);
        assert_eq!(config.min_studies_pooling, 3);
    }

    #[test]
    fn impossible_thresholds_are_rejected() {
        let err = AnalysisConfig::from_toml_str("confidence_level = 1.5").unwrap_err();
        match err {
            ConfigError::InvalidValue { field, .. } => assert_eq!(field, "confidence_level"),
            other => panic!("Expected InvalidValue, got {:?}", other),
        }

        let config = AnalysisConfig {
            reml_max_iterations: 0,
            ..AnalysisConfig::default()
        };
        assert!(config.validate().is_err());

        let config = AnalysisConfig {
            subgroup_covariates: vec![Covariate::PublicationYear],
            ..AnalysisConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn unknown_keys_are_a_parse_error() {
        let err = AnalysisConfig::from_toml_str("confidence = 0.9").unwrap_err();
        assert!(matches!(err, ConfigError::TomlParseError(..)));
    }
}
