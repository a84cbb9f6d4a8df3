//! Between-study heterogeneity of a pooled cohort: Cochran's Q, its
//! chi-square p-value and I² for each outcome and for the outcome pair.
//! τ² is taken from the bivariate fit rather than re-estimated.

use crate::dist::chi_square_sf;
use crate::estimate::{PooledEstimate, cochran_q};
use crate::types::StudyLogits;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OutcomeHeterogeneity {
    pub q: f64,
    pub df: usize,
    pub p_value: f64,
    /// Percentage in [0, 100].
    pub i_squared: f64,
    pub tau_squared: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct JointHeterogeneity {
    pub q: f64,
    pub df: usize,
    pub p_value: f64,
    pub i_squared: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HeterogeneityReport {
    pub sensitivity: OutcomeHeterogeneity,
    pub specificity: OutcomeHeterogeneity,
    pub joint: JointHeterogeneity,
}

impl HeterogeneityReport {
    /// The larger of the two per-outcome I² values.
    pub fn max_i_squared(&self) -> f64 {
        self.sensitivity.i_squared.max(self.specificity.i_squared)
    }
}

/// `I² = max(0, (Q - df) / Q) × 100`, zero whenever `Q ≤ df`.
pub fn i_squared(q: f64, df: usize) -> f64 {
    let df = df as f64;
    if q <= df || q <= 0.0 {
        0.0
    } else {
        100.0 * (q - df) / q
    }
}

fn q_p_value(q: f64, df: usize) -> f64 {
    if df == 0 {
        1.0
    } else {
        chi_square_sf(q, df as f64)
    }
}

fn outcome(y: &[f64], v: &[f64], tau_squared: f64) -> OutcomeHeterogeneity {
    let q = cochran_q(y, v);
    let df = y.len().saturating_sub(1);
    OutcomeHeterogeneity {
        q,
        df,
        p_value: q_p_value(q, df),
        i_squared: i_squared(q, df),
        tau_squared,
    }
}

/// Heterogeneity of `logits` given the bivariate fit `pooled`.
///
/// With independent within-study errors the joint statistic
/// `Σ r_iᵀ S_i⁻¹ r_i` around the bivariate fixed-effect mean separates into
/// the two per-outcome Q values.
pub fn assess(logits: &[StudyLogits], pooled: &PooledEstimate) -> HeterogeneityReport {
    let (y1, v1): (Vec<f64>, Vec<f64>) = logits.iter().map(|l| (l.sens, l.var_sens)).unzip();
    let (y2, v2): (Vec<f64>, Vec<f64>) = logits.iter().map(|l| (l.spec, l.var_spec)).unzip();
    let sensitivity = outcome(&y1, &v1, pooled.between_study.tau2_sens);
    let specificity = outcome(&y2, &v2, pooled.between_study.tau2_spec);

    let q = sensitivity.q + specificity.q;
    let df = 2 * logits.len().saturating_sub(1);
    HeterogeneityReport {
        sensitivity,
        specificity,
        joint: JointHeterogeneity {
            q,
            df,
            p_value: q_p_value(q, df),
            i_squared: i_squared(q, df),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AnalysisConfig;
    use crate::estimate::pool_random_effects;
    use crate::types::{BiomarkerCohort, Covariates, ReportingForm, StudyRecord, TwoByTwo};
    use approx::assert_abs_diff_eq;

    fn cohort(tables: &[(u64, u64, u64, u64)]) -> BiomarkerCohort {
        let studies = tables
            .iter()
            .enumerate()
            .map(|(i, &(tp, fn_count, fp, tn))| {
                StudyRecord::new(
                    format!("S{}", i),
                    "IL-6",
                    TwoByTwo::new(tp, fn_count, fp, tn),
                    ReportingForm::RawCounts,
                    Covariates::default(),
                    0.5,
                )
            })
            .collect();
        BiomarkerCohort::new("IL-6", studies)
    }

    #[test]
    fn identical_studies_show_no_heterogeneity() {
        let data = cohort(&[(40, 10, 5, 45); 3]);
        let pooled = pool_random_effects(&data, &AnalysisConfig::default()).unwrap();
        let report = assess(&data.logits(), &pooled);
        assert_abs_diff_eq!(report.sensitivity.q, 0.0, epsilon = 1e-12);
        assert_eq!(report.sensitivity.df, 2);
        assert_eq!(report.sensitivity.i_squared, 0.0);
        assert_eq!(report.specificity.i_squared, 0.0);
        assert_abs_diff_eq!(report.sensitivity.p_value, 1.0, epsilon = 1e-12);
        assert_eq!(report.joint.df, 4);
    }

    #[test]
    fn outlier_drives_sensitivity_heterogeneity() {
        let data = cohort(&[
            (40, 10, 5, 45),
            (42, 8, 6, 44),
            (38, 12, 5, 45),
            (41, 9, 4, 46),
            (39, 11, 6, 44),
            (10, 40, 5, 45),
        ]);
        let pooled = pool_random_effects(&data, &AnalysisConfig::default()).unwrap();
        let report = assess(&data.logits(), &pooled);

        assert_abs_diff_eq!(report.sensitivity.q, 52.0956, epsilon = 1e-3);
        assert_abs_diff_eq!(report.sensitivity.i_squared, 90.402, epsilon = 1e-2);
        assert!(report.sensitivity.p_value < 1e-8);
        assert_eq!(report.specificity.i_squared, 0.0);
        assert_abs_diff_eq!(report.specificity.p_value, 0.98769, epsilon = 1e-4);
        assert_abs_diff_eq!(report.joint.q, 52.7023, epsilon = 1e-3);
        assert_abs_diff_eq!(report.joint.i_squared, 81.0255, epsilon = 1e-2);
        assert_abs_diff_eq!(report.max_i_squared(), report.sensitivity.i_squared);
        assert!(report.sensitivity.tau_squared > 0.0);
    }

    #[test]
    fn i_squared_is_zero_when_q_does_not_exceed_df() {
        assert_eq!(i_squared(3.0, 5), 0.0);
        assert_eq!(i_squared(5.0, 5), 0.0);
        assert_abs_diff_eq!(i_squared(10.0, 5), 50.0);
    }
}
