//! # Bivariate Random-Effects Estimation
//!
//! Pools the logit sensitivity and logit specificity of a cohort jointly,
//!
//! ```text
//! y_i ~ N(μ, Σ + S_i),   S_i = diag(1/TP + 1/FN, 1/TN + 1/FP)
//! ```
//!
//! The between-study covariance `Σ` is estimated by REML (Fisher scoring on
//! `(τ²_sens, τ_sens,spec, τ²_spec)`), started from the moment estimate and
//! falling back to it whenever the iteration cannot be trusted. A singular
//! `Σ` is repaired by shrinking the correlation, and failing that by pooling
//! the two outcomes independently. Every such decision is recorded as a
//! [`FitFlag`] on the returned [`PooledEstimate`].

use crate::config::AnalysisConfig;
use crate::dist::expit;
use crate::types::{BiomarkerCohort, InsufficientDataError, Stage, StudyLogits};
use ndarray::{Array1, Array2, arr1, arr2};
use ndarray_linalg::error::LinalgError;
use ndarray_linalg::{Determinant, Inverse, Solve};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A variance below this is treated as zero when checking for degeneracy.
const VARIANCE_FLOOR: f64 = 1e-8;
/// Σ is treated as singular when `1 - ρ²` falls below this.
const CORRELATION_MARGIN: f64 = 1e-6;
/// Floor of the denominator in the relative-change convergence test.
const RELATIVE_CHANGE_FLOOR: f64 = 1e-6;
const MAX_STEP_HALVINGS: usize = 30;
/// Tolerated decrease of the REML log-likelihood before a step is halved.
const LOGLIK_SLACK: f64 = 1e-10;

#[derive(Error, Debug)]
pub enum EstimationError {
    #[error(transparent)]
    InsufficientData(#[from] InsufficientDataError),
    #[error("Linear algebra failure while pooling: {0}")]
    LinearAlgebra(#[from] LinalgError),
    #[error("A study's marginal covariance matrix is singular.")]
    SingularWeights,
    #[error("The pooled estimate is not finite.")]
    NonFinite,
}

/// Adjustments made while fitting, attached to the estimate that used them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FitFlag {
    /// REML failed; the moment estimate of Σ was used instead.
    ConvergenceFallback,
    /// Σ was near-singular and its correlation was halved.
    CorrelationShrunk,
    /// Σ stayed singular; the outcomes were pooled with zero correlation.
    DegenerateVarianceFallback,
}

/// How the between-study covariance behind an estimate was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VarianceMethod {
    Reml,
    MethodOfMoments,
    /// Σ fixed at zero.
    FixedEffect,
}

/// The 2×2 between-study covariance of (logit sens, logit spec).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BetweenStudyCovariance {
    pub tau2_sens: f64,
    pub tau2_spec: f64,
    pub covariance: f64,
}

impl BetweenStudyCovariance {
    pub const ZERO: Self = Self {
        tau2_sens: 0.0,
        tau2_spec: 0.0,
        covariance: 0.0,
    };

    /// Correlation implied by Σ; zero when either variance vanishes.
    pub fn correlation(&self) -> f64 {
        let scale = (self.tau2_sens * self.tau2_spec).sqrt();
        if scale > 0.0 {
            (self.covariance / scale).clamp(-1.0, 1.0)
        } else {
            0.0
        }
    }

    /// Projects onto the positive semi-definite cone: variances clipped at zero
    /// and the covariance clipped to `|τ12| ≤ sqrt(τ²_sens τ²_spec)`.
    pub fn projected(self) -> Self {
        let tau2_sens = self.tau2_sens.max(0.0);
        let tau2_spec = self.tau2_spec.max(0.0);
        let limit = (tau2_sens * tau2_spec).sqrt();
        Self {
            tau2_sens,
            tau2_spec,
            covariance: self.covariance.clamp(-limit, limit),
        }
    }

    pub fn is_degenerate(&self) -> bool {
        if self.tau2_sens <= VARIANCE_FLOOR || self.tau2_spec <= VARIANCE_FLOOR {
            return true;
        }
        let rho = self.correlation();
        1.0 - rho * rho <= CORRELATION_MARGIN
    }

    fn with_covariance(self, covariance: f64) -> Self {
        Self { covariance, ..self }
    }

    fn stepped(self, step: &Array1<f64>, scale: f64) -> Self {
        Self {
            tau2_sens: self.tau2_sens + scale * step[0],
            covariance: self.covariance + scale * step[1],
            tau2_spec: self.tau2_spec + scale * step[2],
        }
        .projected()
    }

    fn as_vector(&self) -> [f64; 3] {
        [self.tau2_sens, self.covariance, self.tau2_spec]
    }
}

/// Why REML was abandoned in favour of the moment estimate.
#[derive(Error, Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemlFailure {
    #[error("no convergence within {0} iterations")]
    IterationCap(usize),
    #[error("singular Fisher information")]
    SingularInformation,
    #[error("non-finite likelihood or step")]
    NonFinite,
}

/// Outcome of the REML fit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum VarianceFit {
    Converged {
        covariance: BetweenStudyCovariance,
        iterations: usize,
    },
    FellBackToMoment {
        covariance: BetweenStudyCovariance,
        reason: RemlFailure,
        /// Scoring steps completed before REML stopped.
        iterations: usize,
    },
}

impl VarianceFit {
    pub fn covariance(&self) -> BetweenStudyCovariance {
        match self {
            VarianceFit::Converged { covariance, .. }
            | VarianceFit::FellBackToMoment { covariance, .. } => *covariance,
        }
    }
}

/// A pooled proportion with its logit-scale interval back-transformed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProportionEstimate {
    pub estimate: f64,
    /// Delta-method standard error on the probability scale.
    pub standard_error: f64,
    pub lower: f64,
    pub upper: f64,
}

impl ProportionEstimate {
    fn from_logit(mean: f64, variance: f64, z: f64) -> Self {
        let se = variance.max(0.0).sqrt();
        let p = expit(mean);
        Self {
            estimate: p,
            standard_error: p * (1.0 - p) * se,
            lower: expit(mean - z * se),
            upper: expit(mean + z * se),
        }
    }

    pub fn contains(&self, value: f64) -> bool {
        self.lower <= value && value <= self.upper
    }
}

/// A ratio measure with a log-scale interval.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RatioEstimate {
    pub estimate: f64,
    pub log_standard_error: f64,
    pub lower: f64,
    pub upper: f64,
}

impl RatioEstimate {
    fn from_log(log_value: f64, variance: f64, z: f64) -> Self {
        let se = variance.max(0.0).sqrt();
        Self {
            estimate: log_value.exp(),
            log_standard_error: se,
            lower: (log_value - z * se).exp(),
            upper: (log_value + z * se).exp(),
        }
    }
}

/// The pooled accuracy of one cohort.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PooledEstimate {
    pub method: VarianceMethod,
    pub n_studies: usize,
    pub iterations: usize,
    /// Set when REML was abandoned for the moment estimate.
    pub reml_failure: Option<RemlFailure>,
    pub sensitivity: ProportionEstimate,
    pub specificity: ProportionEstimate,
    pub diagnostic_odds_ratio: RatioEstimate,
    pub positive_likelihood_ratio: RatioEstimate,
    pub negative_likelihood_ratio: RatioEstimate,
    /// Pooled (logit sens, logit spec).
    pub logit_mean: [f64; 2],
    /// `(Σ W_i)⁻¹`, the covariance of the pooled logit means.
    pub logit_covariance: [[f64; 2]; 2],
    pub between_study: BetweenStudyCovariance,
    pub between_study_correlation: f64,
    pub flags: Vec<FitFlag>,
}

impl PooledEstimate {
    pub fn has_flag(&self, flag: FitFlag) -> bool {
        self.flags.contains(&flag)
    }

    /// Pooled false-positive rate, `1 - specificity`.
    pub fn false_positive_rate(&self) -> f64 {
        1.0 - self.specificity.estimate
    }
}

// ========================================================================================
//                                  Moment estimator
// ========================================================================================

/// Inverse-variance weighted mean of `y` with weights `1/(v_i + τ²)`.
/// Returns the mean and the total weight.
pub fn inverse_variance_mean(y: &[f64], v: &[f64], tau2: f64) -> (f64, f64) {
    let (num, den) = y
        .iter()
        .zip(v)
        .fold((0.0, 0.0), |(num, den), (&yi, &vi)| {
            let w = 1.0 / (vi + tau2);
            (num + w * yi, den + w)
        });
    (num / den, den)
}

/// Cochran's Q of one outcome around its fixed-effect mean.
pub fn cochran_q(y: &[f64], v: &[f64]) -> f64 {
    let (mean, _) = inverse_variance_mean(y, v, 0.0);
    y.iter()
        .zip(v)
        .map(|(&yi, &vi)| (yi - mean).powi(2) / vi)
        .sum()
}

/// DerSimonian-Laird between-study variance of one outcome.
pub fn dersimonian_laird(y: &[f64], v: &[f64]) -> f64 {
    let k = y.len();
    if k < 2 {
        return 0.0;
    }
    let weights: Vec<f64> = v.iter().map(|vi| 1.0 / vi).collect();
    let total: f64 = weights.iter().sum();
    let c = total - weights.iter().map(|w| w * w).sum::<f64>() / total;
    if c <= 0.0 {
        return 0.0;
    }
    ((cochran_q(y, v) - (k - 1) as f64) / c).max(0.0)
}

/// Moment estimate of Σ: DerSimonian-Laird variances and the matching
/// cross-product estimator of the covariance, truncated to a valid correlation.
pub fn moment_estimate(logits: &[StudyLogits]) -> BetweenStudyCovariance {
    let (y1, v1): (Vec<f64>, Vec<f64>) = logits.iter().map(|l| (l.sens, l.var_sens)).unzip();
    let (y2, v2): (Vec<f64>, Vec<f64>) = logits.iter().map(|l| (l.spec, l.var_spec)).unzip();
    let tau2_sens = dersimonian_laird(&y1, &v1);
    let tau2_spec = dersimonian_laird(&y2, &v2);

    let (mean1, total1) = inverse_variance_mean(&y1, &v1, 0.0);
    let (mean2, total2) = inverse_variance_mean(&y2, &v2, 0.0);
    let cross_weight: f64 = v1.iter().zip(&v2).map(|(a, b)| 1.0 / (a * b)).sum();
    let c = cross_weight / (total1 * total2);

    let (num, den) = logits.iter().fold((0.0, 0.0), |(num, den), l| {
        let (w1, w2) = (1.0 / l.var_sens, 1.0 / l.var_spec);
        let a = (w1 * w2).sqrt();
        (
            num + a * (l.sens - mean1) * (l.spec - mean2),
            den + a * (1.0 - w1 / total1 - w2 / total2 + c),
        )
    });
    let covariance = if den > 0.0 { num / den } else { 0.0 };

    BetweenStudyCovariance {
        tau2_sens,
        tau2_spec,
        covariance,
    }
    .projected()
}

// ========================================================================================
//                                 REML Fisher scoring
// ========================================================================================

/// Marginal covariance `V = blockdiag(Σ + S_i)` of the stacked outcome vector.
fn marginal_covariance(within: &[(f64, f64)], sigma: &BetweenStudyCovariance) -> Array2<f64> {
    let k = within.len();
    let mut v = Array2::zeros((2 * k, 2 * k));
    for (i, &(var_sens, var_spec)) in within.iter().enumerate() {
        let (a, b) = (2 * i, 2 * i + 1);
        v[[a, a]] = sigma.tau2_sens + var_sens;
        v[[a, b]] = sigma.covariance;
        v[[b, a]] = sigma.covariance;
        v[[b, b]] = sigma.tau2_spec + var_spec;
    }
    v
}

/// `∂V/∂θ_r` for θ = (τ²_sens, τ12, τ²_spec).
fn derivative_pattern(k: usize, component: usize) -> Array2<f64> {
    let mut d = Array2::zeros((2 * k, 2 * k));
    for i in 0..k {
        let (a, b) = (2 * i, 2 * i + 1);
        match component {
            0 => d[[a, a]] = 1.0,
            1 => {
                d[[a, b]] = 1.0;
                d[[b, a]] = 1.0;
            }
            _ => d[[b, b]] = 1.0,
        }
    }
    d
}

struct RemlProjection {
    /// `P = V⁻¹ - V⁻¹X(XᵀV⁻¹X)⁻¹XᵀV⁻¹`
    p: Array2<f64>,
    py: Array1<f64>,
    loglik: f64,
}

fn reml_projection(
    y: &Array1<f64>,
    x: &Array2<f64>,
    within: &[(f64, f64)],
    sigma: &BetweenStudyCovariance,
) -> Result<RemlProjection, LinalgError> {
    let v = marginal_covariance(within, sigma);
    let v_inv = v.inv()?;
    let xt_v_inv = x.t().dot(&v_inv);
    let m = xt_v_inv.dot(x);
    let m_inv = m.inv()?;
    let p = &v_inv - &xt_v_inv.t().dot(&m_inv).dot(&xt_v_inv);
    let py = p.dot(y);
    let (_, ln_det_v) = v.sln_det()?;
    let (_, ln_det_m) = m.sln_det()?;
    let loglik = -0.5 * (ln_det_v + ln_det_m + y.dot(&py));
    Ok(RemlProjection { p, py, loglik })
}

/// REML estimate of Σ by Fisher scoring from `start`. Any failure returns the
/// starting value tagged [`VarianceFit::FellBackToMoment`].
pub fn fit_reml(
    logits: &[StudyLogits],
    start: BetweenStudyCovariance,
    config: &AnalysisConfig,
) -> VarianceFit {
    match reml_iterations(logits, start, config) {
        Ok((covariance, iterations)) => {
            log::debug!(
                "REML converged after {} iterations: tau2 = ({:.4e}, {:.4e}), cov = {:.4e}",
                iterations,
                covariance.tau2_sens,
                covariance.tau2_spec,
                covariance.covariance
            );
            VarianceFit::Converged {
                covariance,
                iterations,
            }
        }
        Err((reason, iterations)) => {
            log::warn!(
                "REML abandoned after {} iterations ({}); using the moment estimate of the between-study covariance.",
                iterations,
                reason
            );
            VarianceFit::FellBackToMoment {
                covariance: start,
                reason,
                iterations,
            }
        }
    }
}

/// On failure, also returns the number of scoring steps completed.
fn reml_iterations(
    logits: &[StudyLogits],
    start: BetweenStudyCovariance,
    config: &AnalysisConfig,
) -> Result<(BetweenStudyCovariance, usize), (RemlFailure, usize)> {
    let k = logits.len();
    let y: Array1<f64> = logits.iter().flat_map(|l| [l.sens, l.spec]).collect();
    let within: Vec<(f64, f64)> = logits.iter().map(|l| (l.var_sens, l.var_spec)).collect();
    let x = Array2::from_shape_fn((2 * k, 2), |(row, col)| if row % 2 == col { 1.0 } else { 0.0 });
    let patterns = [0, 1, 2].map(|r| derivative_pattern(k, r));

    let mut theta = start.projected();
    let mut current =
        reml_projection(&y, &x, &within, &theta).map_err(|_| (RemlFailure::NonFinite, 0))?;
    if !current.loglik.is_finite() {
        return Err((RemlFailure::NonFinite, 0));
    }

    for iteration in 1..=config.reml_max_iterations {
        let completed = iteration - 1;
        let pd: Vec<Array2<f64>> = patterns.iter().map(|d| current.p.dot(d)).collect();
        let score = Array1::from_shape_fn(3, |r| {
            -0.5 * pd[r].diag().sum() + 0.5 * current.py.dot(&patterns[r].dot(&current.py))
        });
        let info = Array2::from_shape_fn((3, 3), |(r, s)| 0.5 * (&pd[r] * &pd[s].t()).sum());
        let step = info
            .solve(&score)
            .map_err(|_| (RemlFailure::SingularInformation, completed))?;
        if !step.iter().all(|s| s.is_finite()) {
            return Err((RemlFailure::NonFinite, completed));
        }

        let mut scale = 1.0;
        let mut halvings = 0;
        let (candidate, next) = loop {
            let candidate = theta.stepped(&step, scale);
            let trial = reml_projection(&y, &x, &within, &candidate)
                .ok()
                .filter(|t| t.loglik.is_finite());
            match trial {
                Some(t) if t.loglik >= current.loglik - LOGLIK_SLACK => break (candidate, t),
                _ if halvings < MAX_STEP_HALVINGS => {
                    scale *= 0.5;
                    halvings += 1;
                }
                Some(t) => break (candidate, t),
                None => return Err((RemlFailure::NonFinite, completed)),
            }
        };

        let change = theta
            .as_vector()
            .iter()
            .zip(candidate.as_vector())
            .map(|(old, new)| (new - old).abs() / old.abs().max(RELATIVE_CHANGE_FLOOR))
            .fold(0.0, f64::max);
        log::debug!(
            "REML iteration {} | loglik {:.8} | tau2 ({:.4e}, {:.4e}) cov {:.4e} | halvings {} | max rel change {:.3e}",
            iteration,
            next.loglik,
            candidate.tau2_sens,
            candidate.tau2_spec,
            candidate.covariance,
            halvings,
            change
        );

        theta = candidate;
        current = next;
        if change < config.reml_tolerance {
            return Ok((theta, iteration));
        }
    }
    Err((
        RemlFailure::IterationCap(config.reml_max_iterations),
        config.reml_max_iterations,
    ))
}

// ========================================================================================
//                                      Pooling
// ========================================================================================

/// Shrinks a near-singular Σ, or falls back to zero correlation, recording
/// the adjustments in `flags`.
fn resolve_degeneracy(
    sigma: BetweenStudyCovariance,
    flags: &mut Vec<FitFlag>,
) -> BetweenStudyCovariance {
    if !sigma.is_degenerate() {
        return sigma;
    }
    let both_variances_positive =
        sigma.tau2_sens > VARIANCE_FLOOR && sigma.tau2_spec > VARIANCE_FLOOR;
    if both_variances_positive {
        let shrunk = sigma.with_covariance(0.5 * sigma.covariance);
        flags.push(FitFlag::CorrelationShrunk);
        if !shrunk.is_degenerate() {
            return shrunk;
        }
    }
    flags.push(FitFlag::DegenerateVarianceFallback);
    sigma.with_covariance(0.0)
}

fn block_inverse(a: f64, b: f64, d: f64) -> Option<Array2<f64>> {
    let det = a * d - b * b;
    if det > 0.0 && det.is_finite() {
        Some(arr2(&[[d / det, -b / det], [-b / det, a / det]]))
    } else {
        None
    }
}

/// Generalized inverse-variance weighted mean `(Σ W_i)⁻¹ Σ W_i y_i` with
/// `W_i = (Σ + S_i)⁻¹`, and its covariance `(Σ W_i)⁻¹`.
fn weighted_mean(
    logits: &[StudyLogits],
    sigma: &BetweenStudyCovariance,
) -> Result<(Array1<f64>, Array2<f64>), EstimationError> {
    let mut precision = Array2::<f64>::zeros((2, 2));
    let mut rhs = Array1::<f64>::zeros(2);
    for l in logits {
        let w = block_inverse(
            sigma.tau2_sens + l.var_sens,
            sigma.covariance,
            sigma.tau2_spec + l.var_spec,
        )
        .ok_or(EstimationError::SingularWeights)?;
        rhs += &w.dot(&arr1(&[l.sens, l.spec]));
        precision += &w;
    }
    let covariance = precision.inv()?;
    let mean = covariance.dot(&rhs);
    if mean.iter().chain(covariance.iter()).all(|x| x.is_finite()) {
        Ok((mean, covariance))
    } else {
        Err(EstimationError::NonFinite)
    }
}

fn summarize(
    logits: &[StudyLogits],
    sigma: BetweenStudyCovariance,
    method: VarianceMethod,
    (iterations, reml_failure): (usize, Option<RemlFailure>),
    flags: Vec<FitFlag>,
    config: &AnalysisConfig,
) -> Result<PooledEstimate, EstimationError> {
    let (mean, cov) = weighted_mean(logits, &sigma)?;
    let z = config.z_critical();
    let (v11, v12, v22) = (cov[[0, 0]], cov[[0, 1]], cov[[1, 1]]);

    let sensitivity = ProportionEstimate::from_logit(mean[0], v11, z);
    let specificity = ProportionEstimate::from_logit(mean[1], v22, z);
    let (se, sp) = (sensitivity.estimate, specificity.estimate);

    let diagnostic_odds_ratio = RatioEstimate::from_log(mean[0] + mean[1], v11 + v22 + 2.0 * v12, z);
    let positive_likelihood_ratio = RatioEstimate::from_log(
        se.ln() - (1.0 - sp).ln(),
        (1.0 - se).powi(2) * v11 + sp * sp * v22 + 2.0 * (1.0 - se) * sp * v12,
        z,
    );
    let negative_likelihood_ratio = RatioEstimate::from_log(
        (1.0 - se).ln() - sp.ln(),
        se * se * v11 + (1.0 - sp).powi(2) * v22 + 2.0 * se * (1.0 - sp) * v12,
        z,
    );

    Ok(PooledEstimate {
        method,
        n_studies: logits.len(),
        iterations,
        reml_failure,
        sensitivity,
        specificity,
        diagnostic_odds_ratio,
        positive_likelihood_ratio,
        negative_likelihood_ratio,
        logit_mean: [mean[0], mean[1]],
        logit_covariance: [[v11, v12], [v12, v22]],
        between_study: sigma,
        between_study_correlation: sigma.correlation(),
        flags,
    })
}

/// Bivariate random-effects pooling of a cohort.
pub fn pool_random_effects(
    cohort: &BiomarkerCohort,
    config: &AnalysisConfig,
) -> Result<PooledEstimate, EstimationError> {
    cohort.require(Stage::Pooling, config.min_studies_pooling)?;
    let logits = cohort.logits();
    let start = moment_estimate(&logits);

    let mut flags = Vec::new();
    let (sigma, method, progress) = match fit_reml(&logits, start, config) {
        VarianceFit::Converged {
            covariance,
            iterations,
        } => (covariance, VarianceMethod::Reml, (iterations, None)),
        VarianceFit::FellBackToMoment {
            covariance,
            reason,
            iterations,
        } => {
            flags.push(FitFlag::ConvergenceFallback);
            (
                covariance,
                VarianceMethod::MethodOfMoments,
                (iterations, Some(reason)),
            )
        }
    };
    let sigma = resolve_degeneracy(sigma, &mut flags);
    if flags.contains(&FitFlag::CorrelationShrunk) {
        log::warn!(
            "{}: between-study correlation was near ±1 and has been shrunk.",
            cohort.biomarker
        );
    }

    let estimate = summarize(&logits, sigma, method, progress, flags, config)?;
    log::info!(
        "{}: pooled {} studies, sensitivity {:.3} [{:.3}, {:.3}], specificity {:.3} [{:.3}, {:.3}]",
        cohort.biomarker,
        estimate.n_studies,
        estimate.sensitivity.estimate,
        estimate.sensitivity.lower,
        estimate.sensitivity.upper,
        estimate.specificity.estimate,
        estimate.specificity.lower,
        estimate.specificity.upper
    );
    Ok(estimate)
}

/// Fixed-effect pooling, i.e. the same model with Σ = 0.
pub fn pool_fixed_effect(
    cohort: &BiomarkerCohort,
    config: &AnalysisConfig,
) -> Result<PooledEstimate, EstimationError> {
    cohort.require(Stage::Pooling, config.min_studies_pooling)?;
    summarize(
        &cohort.logits(),
        BetweenStudyCovariance::ZERO,
        VarianceMethod::FixedEffect,
        (0, None),
        Vec::new(),
        config,
    )
}
