// ========================================================================================
//
//                                   THE PIPELINE
//
// ========================================================================================
//
// Validates a batch of entries, groups the accepted records into one cohort per
// biomarker and runs every stage on each cohort. Cohorts are processed in
// parallel and reported in biomarker order. Inside a cohort, a stage that
// cannot run is recorded as skipped with its reason; only an invalid
// configuration stops the batch.

use crate::bias::{BiasAssessment, assess_publication_bias};
use crate::config::{AnalysisConfig, ConfigError};
use crate::data::IngestedRow;
use crate::estimate::RatioEstimate;
use crate::orchestrate::{
    LeaveOneOutReport, ModelComparison, PooledAnalysis, StageOutcome, SubgroupResult,
    analyze_pooled, analyze_subgroups, compare_models, leave_one_out,
};
use crate::regression::{MetaRegression, meta_regress};
use crate::types::{BiomarkerCohort, Covariate, ReportingForm, StudyRecord};
use crate::validate::{RawStudyEntry, ValidationReport, validate_rows};
use itertools::Itertools;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Overall strength of a pooled result, graded from the larger of the
/// sensitivity and specificity I².
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EvidenceGrade {
    High,
    Moderate,
    Low,
}

impl EvidenceGrade {
    pub fn from_i_squared(i_squared: f64) -> Self {
        if i_squared < 50.0 {
            EvidenceGrade::High
        } else if i_squared < 75.0 {
            EvidenceGrade::Moderate
        } else {
            EvidenceGrade::Low
        }
    }
}

impl fmt::Display for EvidenceGrade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EvidenceGrade::High => "High",
            EvidenceGrade::Moderate => "Moderate",
            EvidenceGrade::Low => "Low",
        };
        f.write_str(name)
    }
}

/// A proportion with its Wald interval clipped to [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WaldInterval {
    pub estimate: f64,
    pub lower: f64,
    pub upper: f64,
}

impl WaldInterval {
    fn new(p: f64, n: u64, z: f64) -> Self {
        let half = if n > 0 {
            z * (p * (1.0 - p) / n as f64).sqrt()
        } else {
            0.0
        };
        Self {
            estimate: p,
            lower: (p - half).max(0.0),
            upper: (p + half).min(1.0),
        }
    }
}

/// Descriptive accuracy of one study. Proportions come from the raw counts;
/// the ratio measures use the continuity-corrected cells so they stay finite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudyMetrics {
    pub study_id: String,
    pub form: ReportingForm,
    pub continuity_corrected: bool,
    pub n_diseased: u64,
    pub n_controls: u64,
    pub sensitivity: WaldInterval,
    pub specificity: WaldInterval,
    pub diagnostic_odds_ratio: RatioEstimate,
    pub positive_likelihood_ratio: f64,
    pub negative_likelihood_ratio: f64,
}

impl StudyMetrics {
    pub fn from_record(record: &StudyRecord, z: f64) -> Self {
        let counts = &record.counts;
        let cells = &record.cells;
        let logits = cells.logits();
        let (sens, spec) = (cells.sensitivity(), cells.specificity());
        Self {
            study_id: record.study_id.clone(),
            form: record.form,
            continuity_corrected: record.correction.is_applied(),
            n_diseased: counts.diseased(),
            n_controls: counts.controls(),
            sensitivity: WaldInterval::new(counts.sensitivity(), counts.diseased(), z),
            specificity: WaldInterval::new(counts.specificity(), counts.controls(), z),
            diagnostic_odds_ratio: {
                let log_dor = logits.log_dor();
                let se = logits.var_log_dor().sqrt();
                RatioEstimate {
                    estimate: log_dor.exp(),
                    log_standard_error: se,
                    lower: (log_dor - z * se).exp(),
                    upper: (log_dor + z * se).exp(),
                }
            },
            positive_likelihood_ratio: sens / (1.0 - spec),
            negative_likelihood_ratio: (1.0 - sens) / spec,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CovariateRegression {
    pub covariate: Covariate,
    pub outcome: StageOutcome<MetaRegression>,
}

/// Everything derived from a cohort large enough to pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PooledCohortReport {
    pub analysis: PooledAnalysis,
    pub evidence_grade: EvidenceGrade,
    pub model_comparison: StageOutcome<ModelComparison>,
    pub subgroups: Vec<SubgroupResult>,
    pub meta_regressions: Vec<CovariateRegression>,
    pub leave_one_out: StageOutcome<LeaveOneOutReport>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CohortOutcome {
    Pooled { report: Box<PooledCohortReport> },
    NarrativeOnly { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BiomarkerReport {
    pub biomarker: String,
    pub n_studies: usize,
    pub total_diseased: u64,
    pub total_controls: u64,
    pub studies: Vec<StudyMetrics>,
    pub publication_bias: BiasAssessment,
    pub outcome: CohortOutcome,
}

impl BiomarkerReport {
    pub fn pooled(&self) -> Option<&PooledCohortReport> {
        match &self.outcome {
            CohortOutcome::Pooled { report } => Some(report),
            CohortOutcome::NarrativeOnly { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub config: AnalysisConfig,
    pub validation: ValidationReport,
    pub biomarkers: Vec<BiomarkerReport>,
}

/// Runs every stage on one cohort.
pub fn analyze_cohort(cohort: &BiomarkerCohort, config: &AnalysisConfig) -> BiomarkerReport {
    let z = config.z_critical();
    let (total_diseased, total_controls) = cohort.totals();
    let studies = cohort
        .studies
        .iter()
        .map(|s| StudyMetrics::from_record(s, z))
        .collect();
    let publication_bias = assess_publication_bias(cohort, config);

    let outcome = match analyze_pooled(cohort, config) {
        Err(e) => {
            log::warn!("{}: narrative synthesis only: {}", cohort.biomarker, e);
            CohortOutcome::NarrativeOnly {
                reason: e.to_string(),
            }
        }
        Ok(analysis) => {
            let evidence_grade =
                EvidenceGrade::from_i_squared(analysis.heterogeneity.max_i_squared());
            let model_comparison =
                StageOutcome::from_result(compare_models(cohort, &analysis.estimate, config));
            let subgroups = config
                .subgroup_covariates
                .iter()
                .flat_map(|&covariate| analyze_subgroups(cohort, covariate, config))
                .collect();
            let meta_regressions = config
                .regression_covariates
                .iter()
                .map(|&covariate| {
                    let result = meta_regress(cohort, covariate, &analysis.estimate, config);
                    if let Err(e) = &result {
                        log::warn!("{}: meta-regression on {} skipped: {}", cohort.biomarker, covariate, e);
                    }
                    CovariateRegression {
                        covariate,
                        outcome: StageOutcome::from_result(result),
                    }
                })
                .collect();
            let leave_one_out = StageOutcome::from_result(leave_one_out(cohort, &analysis, config));
            CohortOutcome::Pooled {
                report: Box::new(PooledCohortReport {
                    analysis,
                    evidence_grade,
                    model_comparison,
                    subgroups,
                    meta_regressions,
                    leave_one_out,
                }),
            }
        }
    };

    BiomarkerReport {
        biomarker: cohort.biomarker.clone(),
        n_studies: cohort.len(),
        total_diseased,
        total_controls,
        studies,
        publication_bias,
        outcome,
    }
}

/// Groups accepted records into cohorts ordered by biomarker name.
pub fn cohorts_by_biomarker(records: &[StudyRecord]) -> Vec<BiomarkerCohort> {
    records
        .iter()
        .cloned()
        .into_group_map_by(|r| r.biomarker.clone())
        .into_iter()
        .sorted_by(|a, b| a.0.cmp(&b.0))
        .map(|(biomarker, studies)| BiomarkerCohort::new(biomarker, studies))
        .collect()
}

/// Validates and analyzes ingested rows.
pub fn analyze_rows(
    rows: Vec<IngestedRow>,
    config: &AnalysisConfig,
) -> Result<BatchReport, ConfigError> {
    config.validate()?;
    let validation = validate_rows(rows, config);
    let cohorts = cohorts_by_biomarker(&validation.accepted);
    log::info!(
        "Analyzing {} biomarkers from {} accepted studies.",
        cohorts.len(),
        validation.accepted.len()
    );
    let biomarkers = cohorts
        .par_iter()
        .map(|cohort| analyze_cohort(cohort, config))
        .collect();
    Ok(BatchReport {
        config: config.clone(),
        validation,
        biomarkers,
    })
}

/// Validates and analyzes in-memory entries.
pub fn analyze_batch(
    entries: &[RawStudyEntry],
    config: &AnalysisConfig,
) -> Result<BatchReport, ConfigError> {
    analyze_rows(entries.iter().cloned().map(Ok).collect(), config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TwoByTwo;
    use approx::assert_abs_diff_eq;

    fn entry(biomarker: &str, id: &str, table: (i64, i64, i64, i64)) -> RawStudyEntry {
        RawStudyEntry {
            study_id: id.to_string(),
            biomarker: biomarker.to_string(),
            true_pos: Some(table.0),
            false_neg: Some(table.1),
            false_pos: Some(table.2),
            true_neg: Some(table.3),
            ..RawStudyEntry::default()
        }
    }

    fn quick_config() -> AnalysisConfig {
        AnalysisConfig {
            bootstrap_replicates: 50,
            ..AnalysisConfig::default()
        }
    }

    #[test]
    fn evidence_grade_thresholds() {
        assert_eq!(EvidenceGrade::from_i_squared(0.0), EvidenceGrade::High);
        assert_eq!(EvidenceGrade::from_i_squared(49.9), EvidenceGrade::High);
        assert_eq!(EvidenceGrade::from_i_squared(50.0), EvidenceGrade::Moderate);
        assert_eq!(EvidenceGrade::from_i_squared(75.0), EvidenceGrade::Low);
    }

    #[test]
    fn study_metrics_follow_the_counts() {
        let record = StudyRecord::new(
            "S1",
            "FGF-21",
            TwoByTwo::new(40, 10, 5, 45),
            ReportingForm::RawCounts,
            Default::default(),
            0.5,
        );
        let metrics = StudyMetrics::from_record(&record, 1.959963984540054);
        assert_abs_diff_eq!(metrics.sensitivity.estimate, 0.8);
        assert_abs_diff_eq!(metrics.sensitivity.lower, 0.8 - 1.959963984540054 * (0.16_f64 / 50.0).sqrt(), epsilon = 1e-12);
        assert_abs_diff_eq!(metrics.diagnostic_odds_ratio.estimate, 36.0, epsilon = 1e-9);
        assert_abs_diff_eq!(metrics.positive_likelihood_ratio, 8.0, epsilon = 1e-9);
        assert_abs_diff_eq!(metrics.negative_likelihood_ratio, 0.2 / 0.9, epsilon = 1e-12);
        assert!(!metrics.continuity_corrected);
    }

    #[test]
    fn batch_separates_biomarkers_and_routes_small_cohorts() {
        let entries = vec![
            entry("GDF-15", "G2", (41, 9, 4, 46)),
            entry("FGF-21", "F1", (40, 10, 5, 45)),
            entry("FGF-21", "F2", (40, 10, 5, 45)),
            entry("FGF-21", "F3", (40, 10, 5, 45)),
            entry("GDF-15", "G1", (40, 10, 5, 45)),
            entry("Lactate", "L1", (-1, 10, 5, 45)),
        ];
        let report = analyze_batch(&entries, &quick_config()).unwrap();
        assert_eq!(report.validation.rejected_count(), 1);

        let names: Vec<_> = report.biomarkers.iter().map(|b| b.biomarker.as_str()).collect();
        assert_eq!(names, vec!["FGF-21", "GDF-15"]);

        let fgf = report.biomarkers[0].pooled().unwrap();
        assert_abs_diff_eq!(fgf.analysis.estimate.sensitivity.estimate, 0.8, epsilon = 1e-9);
        assert_eq!(fgf.evidence_grade, EvidenceGrade::High);
        assert!(matches!(fgf.leave_one_out, StageOutcome::Skipped { .. }));
        assert!(fgf.analysis.sroc.completed().is_none());

        let gdf = &report.biomarkers[1];
        assert!(gdf.pooled().is_none());
        assert_eq!(gdf.studies.len(), 2);
        assert_eq!((gdf.total_diseased, gdf.total_controls), (100, 100));
        assert!(matches!(gdf.publication_bias, BiasAssessment::InsufficientPower { .. }));
    }

    #[test]
    fn invalid_configuration_stops_the_batch() {
        let config = AnalysisConfig {
            confidence_level: 0.0,
            ..AnalysisConfig::default()
        };
        assert!(analyze_batch(&[], &config).is_err());
    }
}
