// ========================================================================================
//
//                                  META-REGRESSION
//
// ========================================================================================
//
// Explains between-study variation of each logit outcome by one study-level
// covariate. Sensitivity and specificity are regressed separately by weighted
// least squares with random-effects weights `1/(v_i + τ²)`, τ² taken from the
// bivariate fit of the whole cohort. Categorical covariates are treatment
// coded against their alphabetically first level; publication year enters
// centred at its mean.

use crate::config::AnalysisConfig;
use crate::dist::{chi_square_sf, normal_two_sided_p};
use crate::estimate::PooledEstimate;
use crate::types::{
    BiomarkerCohort, Covariate, CovariateValue, InsufficientDataError, Stage, StudyLogits,
};
use itertools::Itertools;
use ndarray::{Array1, Array2};
use ndarray_linalg::Inverse;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RegressionError {
    #[error(transparent)]
    InsufficientData(#[from] InsufficientDataError),
    #[error("Covariate '{0}' takes a single value across the contributing studies.")]
    NoVariation(Covariate),
    #[error(
        "Covariate '{covariate}' needs {parameters} parameters but only {studies} studies report it."
    )]
    SaturatedDesign {
        covariate: Covariate,
        studies: usize,
        parameters: usize,
    },
    #[error("The weighted design matrix for covariate '{0}' is singular.")]
    SingularDesign(Covariate),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Coefficient {
    pub term: String,
    pub estimate: f64,
    pub standard_error: f64,
    pub z: f64,
    pub p_value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeRegression {
    pub tau_squared: f64,
    pub coefficients: Vec<Coefficient>,
    /// Residual heterogeneity Q_E around the fixed-effect fit of the same design.
    pub residual_q: f64,
    pub residual_df: usize,
    pub residual_p_value: f64,
}

impl OutcomeRegression {
    pub fn coefficient(&self, term: &str) -> Option<&Coefficient> {
        self.coefficients.iter().find(|c| c.term == term)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetaRegression {
    pub covariate: Covariate,
    pub n_studies: usize,
    /// Reference level of a categorical covariate.
    pub reference_level: Option<String>,
    /// Centring value of a continuous covariate.
    pub centered_at: Option<f64>,
    pub sensitivity: OutcomeRegression,
    pub specificity: OutcomeRegression,
}

struct Design {
    x: Array2<f64>,
    terms: Vec<String>,
    reference_level: Option<String>,
    centered_at: Option<f64>,
}

fn build_design(covariate: Covariate, values: &[CovariateValue]) -> Result<Design, RegressionError> {
    let k = values.len();
    if covariate.is_categorical() {
        let levels: Vec<String> = values.iter().map(ToString::to_string).unique().sorted().collect();
        if levels.len() < 2 {
            return Err(RegressionError::NoVariation(covariate));
        }
        let x = Array2::from_shape_fn((k, levels.len()), |(i, j)| {
            if j == 0 || values[i].to_string() == levels[j] {
                1.0
            } else {
                0.0
            }
        });
        let terms = std::iter::once("intercept".to_string())
            .chain(levels[1..].iter().map(|level| format!("{}={}", covariate, level)))
            .collect();
        Ok(Design {
            x,
            terms,
            reference_level: levels.first().cloned(),
            centered_at: None,
        })
    } else {
        let raw: Vec<f64> = values
            .iter()
            .map(|v| match v {
                CovariateValue::Continuous(x) => *x,
                CovariateValue::Categorical(..) => f64::NAN,
            })
            .collect();
        let mean = raw.iter().sum::<f64>() / k as f64;
        if raw.iter().all(|x| (x - mean).abs() < 1e-12) {
            return Err(RegressionError::NoVariation(covariate));
        }
        let x = Array2::from_shape_fn((k, 2), |(i, j)| if j == 0 { 1.0 } else { raw[i] - mean });
        Ok(Design {
            x,
            terms: vec!["intercept".to_string(), covariate.to_string()],
            reference_level: None,
            centered_at: Some(mean),
        })
    }
}

struct WlsFit {
    beta: Array1<f64>,
    covariance: Array2<f64>,
    weighted_rss: f64,
}

/// Weighted least squares; `(XᵀWX)⁻¹` is the coefficient covariance because
/// the weights are inverse variances.
fn weighted_least_squares(x: &Array2<f64>, y: &Array1<f64>, w: &Array1<f64>) -> Option<WlsFit> {
    let xtw = x.t().to_owned() * w;
    let covariance = xtw.dot(x).inv().ok()?;
    let beta = covariance.dot(&xtw.dot(y));
    let residuals = y - &x.dot(&beta);
    let weighted_rss = (&residuals * &residuals * w).sum();
    let finite = beta.iter().chain(covariance.iter()).all(|v| v.is_finite());
    finite.then_some(WlsFit {
        beta,
        covariance,
        weighted_rss,
    })
}

fn regress_outcome(
    design: &Design,
    y: Array1<f64>,
    v: Array1<f64>,
    tau_squared: f64,
    covariate: Covariate,
) -> Result<OutcomeRegression, RegressionError> {
    let random_weights = v.mapv(|vi| 1.0 / (vi + tau_squared));
    let fit = weighted_least_squares(&design.x, &y, &random_weights)
        .ok_or(RegressionError::SingularDesign(covariate))?;
    let fixed = weighted_least_squares(&design.x, &y, &v.mapv(|vi| 1.0 / vi))
        .ok_or(RegressionError::SingularDesign(covariate))?;

    let coefficients = design
        .terms
        .iter()
        .enumerate()
        .map(|(j, term)| {
            let standard_error = fit.covariance[[j, j]].max(0.0).sqrt();
            let z = fit.beta[j] / standard_error;
            Coefficient {
                term: term.clone(),
                estimate: fit.beta[j],
                standard_error,
                z,
                p_value: normal_two_sided_p(z),
            }
        })
        .collect();

    let residual_df = design.x.nrows() - design.x.ncols();
    Ok(OutcomeRegression {
        tau_squared,
        coefficients,
        residual_q: fixed.weighted_rss,
        residual_df,
        residual_p_value: chi_square_sf(fixed.weighted_rss, residual_df as f64),
    })
}

/// Regresses logit sensitivity and logit specificity on `covariate`.
///
/// Studies that do not report the covariate are dropped before the size check.
pub fn meta_regress(
    cohort: &BiomarkerCohort,
    covariate: Covariate,
    pooled: &PooledEstimate,
    config: &AnalysisConfig,
) -> Result<MetaRegression, RegressionError> {
    let (values, logits): (Vec<CovariateValue>, Vec<StudyLogits>) = cohort
        .studies
        .iter()
        .filter_map(|s| s.covariates.value(covariate).map(|v| (v, s.logits())))
        .unzip();

    if values.len() < config.min_studies_meta_regression {
        return Err(InsufficientDataError {
            stage: Stage::MetaRegression,
            found: values.len(),
            required: config.min_studies_meta_regression,
        }
        .into());
    }

    let design = build_design(covariate, &values)?;
    if design.x.nrows() <= design.x.ncols() {
        return Err(RegressionError::SaturatedDesign {
            covariate,
            studies: design.x.nrows(),
            parameters: design.x.ncols(),
        });
    }

    let column = |f: fn(&StudyLogits) -> f64| logits.iter().map(f).collect::<Array1<f64>>();
    let sensitivity = regress_outcome(
        &design,
        column(|l| l.sens),
        column(|l| l.var_sens),
        pooled.between_study.tau2_sens,
        covariate,
    )?;
    let specificity = regress_outcome(
        &design,
        column(|l| l.spec),
        column(|l| l.var_spec),
        pooled.between_study.tau2_spec,
        covariate,
    )?;

    log::info!(
        "{}: meta-regression on {} over {} studies (residual Q_E sens {:.2}, spec {:.2}).",
        cohort.biomarker,
        covariate,
        values.len(),
        sensitivity.residual_q,
        specificity.residual_q
    );

    Ok(MetaRegression {
        covariate,
        n_studies: values.len(),
        reference_level: design.reference_level,
        centered_at: design.centered_at,
        sensitivity,
        specificity,
    })
}
