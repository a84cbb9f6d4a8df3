//! Deeks' funnel-plot asymmetry test for small-study effects.
//!
//! The log diagnostic odds ratio of each study is regressed on `1/√ESS` with
//! weights `ESS`, where `ESS = 4·N_d·N_c/(N_d + N_c)`. A slope that differs from
//! zero (t-test with `k - 2` degrees of freedom) indicates that smaller
//! studies report systematically different accuracy.

use crate::config::AnalysisConfig;
use crate::dist::student_t_two_sided_p;
use crate::types::BiomarkerCohort;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Too few studies for the asymmetry test to have useful power.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[error(
    "Publication-bias testing needs at least {required} studies; {found} available. No p-value is reported."
)]
pub struct InsufficientPowerWarning {
    pub found: usize,
    pub required: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DeeksTest {
    pub n_studies: usize,
    pub intercept: f64,
    pub slope: f64,
    pub slope_se: f64,
    pub t_statistic: f64,
    pub df: usize,
    pub p_value: f64,
    /// `p_value` below the configured significance level.
    pub asymmetric: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BiasAssessment {
    Tested { test: DeeksTest },
    InsufficientPower { warning: InsufficientPowerWarning },
    /// Every study has the same effective sample size, so there is no funnel.
    NoPrecisionSpread,
}

impl BiasAssessment {
    pub fn test(&self) -> Option<&DeeksTest> {
        match self {
            BiasAssessment::Tested { test } => Some(test),
            BiasAssessment::InsufficientPower { .. } | BiasAssessment::NoPrecisionSpread => None,
        }
    }
}

pub fn assess_publication_bias(cohort: &BiomarkerCohort, config: &AnalysisConfig) -> BiasAssessment {
    let k = cohort.len();
    if k < config.min_studies_bias_test {
        let warning = InsufficientPowerWarning {
            found: k,
            required: config.min_studies_bias_test,
        };
        log::warn!("{}: {}", cohort.biomarker, warning);
        return BiasAssessment::InsufficientPower { warning };
    }

    // (1/√ESS, ln DOR, ESS)
    let points: Vec<(f64, f64, f64)> = cohort
        .studies
        .iter()
        .map(|s| {
            let ess = s.counts.effective_sample_size();
            (1.0 / ess.sqrt(), s.logits().log_dor(), ess)
        })
        .collect();

    let total: f64 = points.iter().map(|p| p.2).sum();
    let x_bar = points.iter().map(|p| p.2 * p.0).sum::<f64>() / total;
    let y_bar = points.iter().map(|p| p.2 * p.1).sum::<f64>() / total;
    let sxx: f64 = points.iter().map(|p| p.2 * (p.0 - x_bar).powi(2)).sum();
    if sxx <= 1e-12 {
        log::warn!("{}: all studies share one effective sample size; Deeks' test skipped.", cohort.biomarker);
        return BiasAssessment::NoPrecisionSpread;
    }
    let sxy: f64 = points
        .iter()
        .map(|p| p.2 * (p.0 - x_bar) * (p.1 - y_bar))
        .sum();
    let slope = sxy / sxx;
    let intercept = y_bar - slope * x_bar;

    let df = k - 2;
    let sigma2 = points
        .iter()
        .map(|p| p.2 * (p.1 - intercept - slope * p.0).powi(2))
        .sum::<f64>()
        / df as f64;
    let slope_se = (sigma2 / sxx).sqrt();
    let t_statistic = slope / slope_se;
    let p_value = student_t_two_sided_p(t_statistic, df as f64);
    let asymmetric = p_value < config.bias_significance;

    log::info!(
        "{}: Deeks' test slope {:.3} (SE {:.3}), t = {:.3}, p = {:.4}{}",
        cohort.biomarker,
        slope,
        slope_se,
        t_statistic,
        p_value,
        if asymmetric { " (asymmetric)" } else { "" }
    );

    BiasAssessment::Tested {
        test: DeeksTest {
            n_studies: k,
            intercept,
            slope,
            slope_se,
            t_statistic,
            df,
            p_value,
            asymmetric,
        },
    }
}
