//! # Summary ROC Curve
//!
//! Moses-Littenberg construction. Each study contributes
//! `D = logit TPR - logit FPR` (the log diagnostic odds ratio) and
//! `S = logit TPR + logit FPR` (a proxy for its positivity threshold). The
//! line `D = a + b·S` is fitted by least squares, D regressed on S so that
//! `b = 0` is the symmetric constant-DOR curve, and mapped back to ROC space:
//!
//! ```text
//! logit TPR = (S + D(S)) / 2,    logit FPR = (S - D(S)) / 2
//! ```
//!
//! The area under the curve is integrated only over the S range the studies
//! actually cover. Its confidence interval comes from a parametric bootstrap
//! in which every replicate owns its own seeded generator, so the interval
//! does not depend on how rayon schedules the replicates.

use crate::config::{AnalysisConfig, SrocWeighting};
use crate::dist::{expit, logit};
use crate::types::{BiomarkerCohort, CellCounts, InsufficientDataError, Stage, StudyLogits, TwoByTwo};
use itertools::Itertools;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Binomial, Distribution};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Two parameters plus one residual degree of freedom.
const MIN_STUDIES_FOR_FIT: usize = 3;
const AUC_GRID_POINTS: usize = 200;
const SPREAD_FLOOR: f64 = 1e-12;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SrocError {
    #[error(transparent)]
    InsufficientData(#[from] InsufficientDataError),
    #[error("All studies share the same threshold proxy S; the SROC line is not identifiable.")]
    NoThresholdSpread,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Reliability {
    Reliable,
    Unreliable { reason: String },
}

impl Reliability {
    pub fn is_reliable(&self) -> bool {
        matches!(self, Reliability::Reliable)
    }
}

/// Percentile bootstrap interval for the normalized partial AUC.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AucInterval {
    pub lower: f64,
    pub upper: f64,
    /// Replicates that produced a curve; degenerate resamples are skipped.
    pub replicates: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SrocCurve {
    pub weighting: SrocWeighting,
    pub n_studies: usize,
    pub intercept: f64,
    pub intercept_se: f64,
    pub slope: f64,
    pub slope_se: f64,
    pub s_range: (f64, f64),
    pub fpr_range: (f64, f64),
    /// Area under the curve over the observed FPR span.
    pub partial_auc: f64,
    /// `partial_auc` divided by the FPR span, i.e. the mean TPR on that span.
    pub normalized_auc: f64,
    pub auc_interval: Option<AucInterval>,
    pub reliability: Reliability,
}

impl SrocCurve {
    /// The (FPR, TPR) point of the curve at threshold proxy `s`.
    pub fn point_at(&self, s: f64) -> (f64, f64) {
        roc_point(self.intercept, self.slope, s)
    }

    /// TPR on the curve at a given FPR:
    /// `logit TPR = a/(1-b) + (1+b)/(1-b) · logit FPR`.
    pub fn tpr_at_fpr(&self, fpr: f64) -> f64 {
        let (a, b) = (self.intercept, self.slope);
        expit(a / (1.0 - b) + (1.0 + b) / (1.0 - b) * logit(fpr))
    }
}

fn roc_point(a: f64, b: f64, s: f64) -> (f64, f64) {
    let d = a + b * s;
    (expit((s - d) / 2.0), expit((s + d) / 2.0))
}

struct LineFit {
    intercept: f64,
    slope: f64,
    intercept_se: f64,
    slope_se: f64,
}

fn fit_line(points: &[(f64, f64, f64)]) -> Result<LineFit, SrocError> {
    // (S, D, weight)
    let total: f64 = points.iter().map(|p| p.2).sum();
    let s_bar = points.iter().map(|p| p.2 * p.0).sum::<f64>() / total;
    let d_bar = points.iter().map(|p| p.2 * p.1).sum::<f64>() / total;
    let sxx: f64 = points.iter().map(|p| p.2 * (p.0 - s_bar).powi(2)).sum();
    if sxx <= SPREAD_FLOOR {
        return Err(SrocError::NoThresholdSpread);
    }
    let sxd: f64 = points
        .iter()
        .map(|p| p.2 * (p.0 - s_bar) * (p.1 - d_bar))
        .sum();
    let slope = sxd / sxx;
    let intercept = d_bar - slope * s_bar;

    let df = points.len().saturating_sub(2);
    let sigma2 = if df > 0 {
        points
            .iter()
            .map(|p| p.2 * (p.1 - intercept - slope * p.0).powi(2))
            .sum::<f64>()
            / df as f64
    } else {
        f64::NAN
    };
    Ok(LineFit {
        intercept,
        slope,
        intercept_se: (sigma2 * (1.0 / total + s_bar * s_bar / sxx)).sqrt(),
        slope_se: (sigma2 / sxx).sqrt(),
    })
}

fn line_points(logits: &[StudyLogits], weighting: SrocWeighting) -> Vec<(f64, f64, f64)> {
    logits
        .iter()
        .map(|l| {
            let weight = match weighting {
                SrocWeighting::Unweighted => 1.0,
                SrocWeighting::InverseVariance => 1.0 / l.var_log_dor(),
            };
            (l.threshold_sum(), l.log_dor(), weight)
        })
        .collect()
}

fn s_range(points: &[(f64, f64, f64)]) -> (f64, f64) {
    points
        .iter()
        .map(|p| p.0)
        .minmax()
        .into_option()
        .unwrap_or((0.0, 0.0))
}

/// Trapezoid-rule area under the curve between `s_lo` and `s_hi`.
/// Returns (raw area, FPR span).
fn partial_area(a: f64, b: f64, s_lo: f64, s_hi: f64) -> (f64, f64) {
    let step = (s_hi - s_lo) / (AUC_GRID_POINTS - 1) as f64;
    let area: f64 = (0..AUC_GRID_POINTS)
        .map(|j| roc_point(a, b, s_lo + step * j as f64))
        .tuple_windows()
        .map(|((f0, t0), (f1, t1))| (f1 - f0) * (t0 + t1) / 2.0)
        .sum();
    let span = roc_point(a, b, s_hi).0 - roc_point(a, b, s_lo).0;
    (area.abs(), span.abs())
}

fn normalized_area(a: f64, b: f64, s_lo: f64, s_hi: f64) -> f64 {
    let (area, span) = partial_area(a, b, s_lo, s_hi);
    if span > 0.0 { area / span } else { f64::NAN }
}

fn assess_reliability(n_studies: usize, slope: f64, config: &AnalysisConfig) -> Reliability {
    let mut reasons = Vec::new();
    if n_studies < config.min_studies_reliable_sroc {
        reasons.push(format!(
            "only {} studies (at least {} needed)",
            n_studies, config.min_studies_reliable_sroc
        ));
    }
    if slope >= 1.0 {
        reasons.push(format!("slope b = {:.3} ≥ 1 gives a non-monotone curve", slope));
    }
    if reasons.is_empty() {
        Reliability::Reliable
    } else {
        Reliability::Unreliable {
            reason: reasons.join("; "),
        }
    }
}

/// Linear-interpolation percentile of sorted data.
fn percentile(sorted: &[f64], q: f64) -> f64 {
    let position = q * (sorted.len() - 1) as f64;
    let lo = position.floor() as usize;
    let hi = position.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (position - lo as f64)
}

/// One parametric bootstrap replicate of the normalized AUC.
fn bootstrap_replicate(
    tables: &[TwoByTwo],
    replicate: usize,
    config: &AnalysisConfig,
) -> Option<f64> {
    let mut rng = StdRng::seed_from_u64(config.bootstrap_seed.wrapping_add(replicate as u64));
    let mut resampled = Vec::with_capacity(tables.len());
    for table in tables {
        let sens = Binomial::new(table.diseased(), table.sensitivity()).ok()?;
        let fpr = Binomial::new(table.controls(), 1.0 - table.specificity()).ok()?;
        let tp = sens.sample(&mut rng);
        let fp = fpr.sample(&mut rng);
        let table = TwoByTwo::new(tp, table.diseased() - tp, fp, table.controls() - fp);
        let (cells, _) = CellCounts::from_table(&table, config.continuity_correction);
        resampled.push(cells.logits());
    }
    let points = line_points(&resampled, config.sroc_weighting);
    let fit = fit_line(&points).ok()?;
    let (lo, hi) = s_range(&points);
    let auc = normalized_area(fit.intercept, fit.slope, lo, hi);
    auc.is_finite().then_some(auc)
}

fn bootstrap_interval(tables: &[TwoByTwo], config: &AnalysisConfig) -> Option<AucInterval> {
    if config.bootstrap_replicates == 0 {
        return None;
    }
    let mut aucs: Vec<f64> = (0..config.bootstrap_replicates)
        .into_par_iter()
        .filter_map(|r| bootstrap_replicate(tables, r, config))
        .collect();
    if aucs.len() < 2 {
        return None;
    }
    aucs.sort_by(f64::total_cmp);
    let alpha = 1.0 - config.confidence_level;
    Some(AucInterval {
        lower: percentile(&aucs, alpha / 2.0),
        upper: percentile(&aucs, 1.0 - alpha / 2.0),
        replicates: aucs.len(),
    })
}

/// Fits the SROC curve of a cohort, including its bootstrap AUC interval.
pub fn fit_sroc(cohort: &BiomarkerCohort, config: &AnalysisConfig) -> Result<SrocCurve, SrocError> {
    cohort.require(Stage::SrocFit, MIN_STUDIES_FOR_FIT)?;
    let points = line_points(&cohort.logits(), config.sroc_weighting);
    let fit = fit_line(&points)?;
    let (s_lo, s_hi) = s_range(&points);
    let (partial_auc, span) = partial_area(fit.intercept, fit.slope, s_lo, s_hi);
    let normalized_auc = if span > 0.0 { partial_auc / span } else { f64::NAN };

    let fpr_lo = roc_point(fit.intercept, fit.slope, s_lo).0;
    let fpr_hi = roc_point(fit.intercept, fit.slope, s_hi).0;

    let reliability = assess_reliability(cohort.len(), fit.slope, config);
    if let Reliability::Unreliable { reason } = &reliability {
        log::warn!("{}: SROC curve is unreliable: {}.", cohort.biomarker, reason);
    }

    let tables: Vec<TwoByTwo> = cohort.studies.iter().map(|s| s.counts).collect();
    let auc_interval = bootstrap_interval(&tables, config);

    Ok(SrocCurve {
        weighting: config.sroc_weighting,
        n_studies: cohort.len(),
        intercept: fit.intercept,
        intercept_se: fit.intercept_se,
        slope: fit.slope,
        slope_se: fit.slope_se,
        s_range: (s_lo, s_hi),
        fpr_range: (fpr_lo.min(fpr_hi), fpr_lo.max(fpr_hi)),
        partial_auc,
        normalized_auc,
        auc_interval,
        reliability,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::estimate::pool_random_effects;
    use crate::types::{Covariates, ReportingForm, StudyRecord};
    use approx::assert_abs_diff_eq;

    fn cohort(tables: &[(u64, u64, u64, u64)]) -> BiomarkerCohort {
        let studies = tables
            .iter()
            .enumerate()
            .map(|(i, &(tp, fn_count, fp, tn))| {
                StudyRecord::new(
                    format!("S{}", i),
                    "FGF-21",
                    TwoByTwo::new(tp, fn_count, fp, tn),
                    ReportingForm::RawCounts,
                    Covariates::default(),
                    0.5,
                )
            })
            .collect();
        BiomarkerCohort::new("FGF-21", studies)
    }

    fn reference_seven() -> BiomarkerCohort {
        cohort(&[
            (56, 14, 10, 60),
            (71, 25, 10, 90),
            (40, 11, 6, 45),
            (35, 9, 7, 41),
            (62, 15, 9, 71),
            (48, 16, 8, 52),
            (45, 11, 7, 43),
        ])
    }

    fn quick_config() -> AnalysisConfig {
        AnalysisConfig {
            bootstrap_replicates: 200,
            ..AnalysisConfig::default()
        }
    }

    #[test]
    fn reference_line_and_area() {
        let curve = fit_sroc(&reference_seven(), &quick_config()).unwrap();
        assert_abs_diff_eq!(curve.intercept, 3.19405, epsilon = 1e-4);
        assert_abs_diff_eq!(curve.slope, -0.03794, epsilon = 1e-4);
        assert_abs_diff_eq!(curve.slope_se, 0.25803, epsilon = 1e-4);
        assert_abs_diff_eq!(curve.intercept_se, 0.17896, epsilon = 1e-4);
        assert_abs_diff_eq!(curve.s_range.0, -1.15342, epsilon = 1e-4);
        assert_abs_diff_eq!(curve.s_range.1, -0.40547, epsilon = 1e-4);
        assert_abs_diff_eq!(curve.fpr_range.0, 0.10014, epsilon = 1e-4);
        assert_abs_diff_eq!(curve.fpr_range.1, 0.14095, epsilon = 1e-4);
        assert_abs_diff_eq!(curve.normalized_auc, 0.7735, epsilon = 1e-3);
        assert_abs_diff_eq!(curve.partial_auc, 0.03156, epsilon = 1e-4);
        assert!(curve.reliability.is_reliable());
    }

    #[test]
    fn inverse_variance_weighting_matches_a_hand_weighted_fit() {
        let tables = [
            (56.0, 14.0, 10.0, 60.0),
            (71.0, 25.0, 10.0, 90.0),
            (40.0, 11.0, 6.0, 45.0),
            (35.0, 9.0, 7.0, 41.0),
            (62.0, 15.0, 9.0, 71.0),
            (48.0, 16.0, 8.0, 52.0),
            (45.0, 11.0, 7.0, 43.0),
        ];
        // (S, D, w) straight from the counts; no cell is zero.
        let points: Vec<(f64, f64, f64)> = tables
            .iter()
            .map(|&(tp, fn_count, fp, tn): &(f64, f64, f64, f64)| {
                let sens = (tp / fn_count).ln();
                let spec = (tn / fp).ln();
                let var = 1.0 / tp + 1.0 / fn_count + 1.0 / tn + 1.0 / fp;
                (sens - spec, sens + spec, 1.0 / var)
            })
            .collect();
        let w: f64 = points.iter().map(|p| p.2).sum();
        let s_bar = points.iter().map(|p| p.2 * p.0).sum::<f64>() / w;
        let d_bar = points.iter().map(|p| p.2 * p.1).sum::<f64>() / w;
        let sxx: f64 = points.iter().map(|p| p.2 * (p.0 - s_bar).powi(2)).sum();
        let sxd: f64 = points.iter().map(|p| p.2 * (p.0 - s_bar) * (p.1 - d_bar)).sum();
        let slope = sxd / sxx;
        let intercept = d_bar - slope * s_bar;
        let rss: f64 = points
            .iter()
            .map(|p| p.2 * (p.1 - intercept - slope * p.0).powi(2))
            .sum();
        let slope_se = (rss / 5.0 / sxx).sqrt();

        let config = AnalysisConfig {
            sroc_weighting: SrocWeighting::InverseVariance,
            bootstrap_replicates: 0,
            ..AnalysisConfig::default()
        };
        let curve = fit_sroc(&reference_seven(), &config).unwrap();
        assert_eq!(curve.weighting, SrocWeighting::InverseVariance);
        assert_abs_diff_eq!(curve.intercept, intercept, epsilon = 1e-10);
        assert_abs_diff_eq!(curve.slope, slope, epsilon = 1e-10);
        assert_abs_diff_eq!(curve.slope_se, slope_se, epsilon = 1e-10);
        assert!(curve.auc_interval.is_none());

        let unweighted = fit_sroc(&reference_seven(), &AnalysisConfig {
            bootstrap_replicates: 0,
            ..AnalysisConfig::default()
        })
        .unwrap();
        assert!((unweighted.slope - curve.slope).abs() > 1e-6);
    }

    #[test]
    fn curve_passes_through_the_pooled_sensitivity_interval() {
        let data = reference_seven();
        let config = quick_config();
        let pooled = pool_random_effects(&data, &config).unwrap();
        let curve = fit_sroc(&data, &config).unwrap();
        let tpr = curve.tpr_at_fpr(pooled.false_positive_rate());
        assert_abs_diff_eq!(tpr, 0.7817, epsilon = 1e-3);
        assert!(pooled.sensitivity.contains(tpr));

        let (fpr, tpr_at_s) = curve.point_at(-0.8);
        assert_abs_diff_eq!(curve.tpr_at_fpr(fpr), tpr_at_s, epsilon = 1e-12);
    }

    #[test]
    fn bootstrap_is_reproducible_and_brackets_the_estimate() {
        let data = reference_seven();
        let config = quick_config();
        let first = fit_sroc(&data, &config).unwrap();
        let second = fit_sroc(&data, &config).unwrap();
        assert_eq!(first.auc_interval, second.auc_interval);

        let interval = first.auc_interval.unwrap();
        assert_eq!(interval.replicates, 200);
        assert!(0.0 < interval.lower && interval.lower <= interval.upper && interval.upper < 1.0);
        assert!(interval.lower <= first.normalized_auc && first.normalized_auc <= interval.upper);
    }

    #[test]
    fn identical_studies_have_no_threshold_spread() {
        let err = fit_sroc(&cohort(&[(40, 10, 5, 45); 4]), &quick_config()).unwrap_err();
        assert_eq!(err, SrocError::NoThresholdSpread);
    }

    #[test]
    fn small_cohorts_are_marked_unreliable() {
        let curve = fit_sroc(
            &cohort(&[(40, 10, 5, 45), (30, 20, 8, 42), (45, 5, 12, 38)]),
            &quick_config(),
        )
        .unwrap();
        match curve.reliability {
            Reliability::Unreliable { reason } => assert!(reason.contains("only 3 studies")),
            Reliability::Reliable => panic!("three studies should not give a reliable curve"),
        }
    }

    #[test]
    fn steep_slope_is_flagged() {
        let config = AnalysisConfig::default();
        assert!(assess_reliability(10, 0.2, &config).is_reliable());
        assert!(!assess_reliability(10, 1.0, &config).is_reliable());
        assert!(!assess_reliability(10, 1.7, &config).is_reliable());
    }

    #[test]
    fn percentile_interpolates() {
        let sorted = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_abs_diff_eq!(percentile(&sorted, 0.0), 1.0);
        assert_abs_diff_eq!(percentile(&sorted, 0.5), 3.0);
        assert_abs_diff_eq!(percentile(&sorted, 0.125), 1.5);
    }
}
