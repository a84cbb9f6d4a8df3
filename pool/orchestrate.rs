// ========================================================================================
//
//                          SUBGROUP & SENSITIVITY ORCHESTRATION
//
// ========================================================================================
//
// Re-runs the estimator on subsets of a cohort: one partition per level of a
// categorical covariate, and one reduced cohort per omitted study. Subsets are
// independent and are evaluated on the rayon pool; results are collected in a
// fixed order so repeated runs produce identical output.

use crate::config::AnalysisConfig;
use crate::estimate::{EstimationError, PooledEstimate, pool_fixed_effect, pool_random_effects};
use crate::heterogeneity::{self, HeterogeneityReport};
use crate::sroc::{SrocCurve, fit_sroc};
use crate::types::{BiomarkerCohort, Covariate, InsufficientDataError, Stage};
use itertools::Itertools;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt::Display;

/// Result of an optional stage: either its output or the reason it was skipped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StageOutcome<T> {
    Completed { result: T },
    Skipped { reason: String },
}

impl<T> StageOutcome<T> {
    pub fn from_result<E: Display>(result: Result<T, E>) -> Self {
        match result {
            Ok(result) => StageOutcome::Completed { result },
            Err(e) => StageOutcome::Skipped {
                reason: e.to_string(),
            },
        }
    }

    pub fn completed(&self) -> Option<&T> {
        match self {
            StageOutcome::Completed { result } => Some(result),
            StageOutcome::Skipped { .. } => None,
        }
    }
}

/// A pooled estimate with the heterogeneity and SROC results derived from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PooledAnalysis {
    pub estimate: PooledEstimate,
    pub heterogeneity: HeterogeneityReport,
    pub sroc: StageOutcome<SrocCurve>,
}

/// Pools a cohort and describes its heterogeneity and SROC curve.
pub fn analyze_pooled(
    cohort: &BiomarkerCohort,
    config: &AnalysisConfig,
) -> Result<PooledAnalysis, EstimationError> {
    let estimate = pool_random_effects(cohort, config)?;
    let heterogeneity = heterogeneity::assess(&cohort.logits(), &estimate);
    let sroc = StageOutcome::from_result(fit_sroc(cohort, config));
    if let StageOutcome::Skipped { reason } = &sroc {
        log::warn!("{}: SROC curve skipped: {}", cohort.biomarker, reason);
    }
    Ok(PooledAnalysis {
        estimate,
        heterogeneity,
        sroc,
    })
}

// ========================================================================================
//                                     Subgroups
// ========================================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SubgroupOutcome {
    Pooled { analysis: Box<PooledAnalysis> },
    NarrativeOnly { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubgroupResult {
    pub covariate: Covariate,
    /// The covariate level, or `None` for the studies that do not report it.
    pub level: Option<String>,
    pub n_studies: usize,
    pub study_ids: Vec<String>,
    pub outcome: SubgroupOutcome,
}

/// Partitions `cohort` by the levels of a categorical `covariate` and pools
/// every partition large enough to pool. Partitions are ordered by level,
/// with the studies missing the covariate last.
pub fn analyze_subgroups(
    cohort: &BiomarkerCohort,
    covariate: Covariate,
    config: &AnalysisConfig,
) -> Vec<SubgroupResult> {
    let partitions: Vec<(Option<String>, BiomarkerCohort)> = cohort
        .studies
        .iter()
        .cloned()
        .into_group_map_by(|s| s.covariates.value(covariate).map(|v| v.to_string()))
        .into_iter()
        .sorted_by(|(a, _), (b, _)| match (a, b) {
            (Some(a), Some(b)) => a.cmp(b),
            (Some(..), None) => std::cmp::Ordering::Less,
            (None, Some(..)) => std::cmp::Ordering::Greater,
            (None, None) => std::cmp::Ordering::Equal,
        })
        .map(|(level, studies)| (level, BiomarkerCohort::new(cohort.biomarker.clone(), studies)))
        .collect();

    partitions
        .into_par_iter()
        .map(|(level, part)| {
            let outcome = match &level {
                None => SubgroupOutcome::NarrativeOnly {
                    reason: format!("{} not reported", covariate),
                },
                Some(..) => match analyze_pooled(&part, config) {
                    Ok(analysis) => SubgroupOutcome::Pooled {
                        analysis: Box::new(analysis),
                    },
                    Err(e) => SubgroupOutcome::NarrativeOnly {
                        reason: e.to_string(),
                    },
                },
            };
            SubgroupResult {
                covariate,
                level,
                n_studies: part.len(),
                study_ids: part.studies.iter().map(|s| s.study_id.clone()).collect(),
                outcome,
            }
        })
        .collect()
}

// ========================================================================================
//                                   Leave-one-out
// ========================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InfluenceReason {
    SensitivityShift,
    SpecificityShift,
    SensitivityHeterogeneityHalved,
    SpecificityHeterogeneityHalved,
}

/// The pooled result of a cohort without one study.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReducedPool {
    pub sensitivity: f64,
    pub specificity: f64,
    /// Pooled value without the study minus the value with all studies.
    pub sensitivity_shift: f64,
    pub specificity_shift: f64,
    pub i_squared_sensitivity: f64,
    pub i_squared_specificity: f64,
    pub reasons: Vec<InfluenceReason>,
}

/// One omitted study. A reduced cohort that cannot be re-pooled keeps its
/// entry as `Skipped`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InfluenceEntry {
    pub omitted_study: String,
    pub outcome: StageOutcome<ReducedPool>,
}

impl InfluenceEntry {
    pub fn reduced(&self) -> Option<&ReducedPool> {
        self.outcome.completed()
    }

    pub fn is_influential(&self) -> bool {
        self.reduced().is_some_and(|r| !r.reasons.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaveOneOutReport {
    pub baseline_sensitivity: f64,
    pub baseline_specificity: f64,
    pub baseline_i_squared_sensitivity: f64,
    pub baseline_i_squared_specificity: f64,
    pub entries: Vec<InfluenceEntry>,
}

impl LeaveOneOutReport {
    pub fn influential(&self) -> impl Iterator<Item = &InfluenceEntry> {
        self.entries.iter().filter(|e| e.is_influential())
    }
}

fn halved(baseline: f64, reduced: f64) -> bool {
    baseline > 0.0 && reduced < 0.5 * baseline
}

fn reduced_pool(
    reduced: &BiomarkerCohort,
    baseline: &PooledAnalysis,
    config: &AnalysisConfig,
) -> Result<ReducedPool, EstimationError> {
    let estimate = pool_random_effects(reduced, config)?;
    let heterogeneity = heterogeneity::assess(&reduced.logits(), &estimate);
    let sensitivity_shift = estimate.sensitivity.estimate - baseline.estimate.sensitivity.estimate;
    let specificity_shift = estimate.specificity.estimate - baseline.estimate.specificity.estimate;
    let i2_sens = heterogeneity.sensitivity.i_squared;
    let i2_spec = heterogeneity.specificity.i_squared;
    let base_i2_sens = baseline.heterogeneity.sensitivity.i_squared;
    let base_i2_spec = baseline.heterogeneity.specificity.i_squared;

    let reasons = [
        (sensitivity_shift.abs() > config.influence_threshold, InfluenceReason::SensitivityShift),
        (specificity_shift.abs() > config.influence_threshold, InfluenceReason::SpecificityShift),
        (halved(base_i2_sens, i2_sens), InfluenceReason::SensitivityHeterogeneityHalved),
        (halved(base_i2_spec, i2_spec), InfluenceReason::SpecificityHeterogeneityHalved),
    ]
    .into_iter()
    .filter_map(|(hit, reason)| hit.then_some(reason))
    .collect();

    Ok(ReducedPool {
        sensitivity: estimate.sensitivity.estimate,
        specificity: estimate.specificity.estimate,
        sensitivity_shift,
        specificity_shift,
        i_squared_sensitivity: i2_sens,
        i_squared_specificity: i2_spec,
        reasons,
    })
}

fn influence_entry(
    cohort: &BiomarkerCohort,
    index: usize,
    baseline: &PooledAnalysis,
    config: &AnalysisConfig,
) -> InfluenceEntry {
    let omitted_study = cohort.studies[index].study_id.clone();
    let outcome = StageOutcome::from_result(reduced_pool(&cohort.without(index), baseline, config));
    if let StageOutcome::Skipped { reason } = &outcome {
        log::warn!(
            "{}: re-pooling without '{}' failed: {}",
            cohort.biomarker,
            omitted_study,
            reason
        );
    }
    InfluenceEntry {
        omitted_study,
        outcome,
    }
}

/// Re-pools the cohort once per omitted study and flags the studies whose
/// omission moves the result. Every study gets an entry.
pub fn leave_one_out(
    cohort: &BiomarkerCohort,
    baseline: &PooledAnalysis,
    config: &AnalysisConfig,
) -> Result<LeaveOneOutReport, InsufficientDataError> {
    cohort.require(Stage::LeaveOneOut, config.min_studies_pooling + 1)?;
    let entries: Vec<InfluenceEntry> = (0..cohort.len())
        .into_par_iter()
        .map(|index| influence_entry(cohort, index, baseline, config))
        .collect();

    let report = LeaveOneOutReport {
        baseline_sensitivity: baseline.estimate.sensitivity.estimate,
        baseline_specificity: baseline.estimate.specificity.estimate,
        baseline_i_squared_sensitivity: baseline.heterogeneity.sensitivity.i_squared,
        baseline_i_squared_specificity: baseline.heterogeneity.specificity.i_squared,
        entries,
    };
    for entry in report.influential() {
        log::info!(
            "{}: study '{}' is influential ({:?}).",
            cohort.biomarker,
            entry.omitted_study,
            entry.reduced().map(|r| r.reasons.as_slice()).unwrap_or_default()
        );
    }
    Ok(report)
}

// ========================================================================================
//                                 Model comparison
// ========================================================================================

/// The fixed-effect estimate alongside its difference from the random-effects one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelComparison {
    pub fixed_effect: PooledEstimate,
    /// Random-effects minus fixed-effect pooled sensitivity.
    pub sensitivity_difference: f64,
    pub specificity_difference: f64,
}

pub fn compare_models(
    cohort: &BiomarkerCohort,
    random_effects: &PooledEstimate,
    config: &AnalysisConfig,
) -> Result<ModelComparison, EstimationError> {
    let fixed_effect = pool_fixed_effect(cohort, config)?;
    Ok(ModelComparison {
        sensitivity_difference: random_effects.sensitivity.estimate
            - fixed_effect.sensitivity.estimate,
        specificity_difference: random_effects.specificity.estimate
            - fixed_effect.specificity.estimate,
        fixed_effect,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Covariates, ReportingForm, StudyRecord, TwoByTwo};
    use approx::assert_abs_diff_eq;

    fn study(id: &str, table: (u64, u64, u64, u64), age_group: Option<&str>) -> StudyRecord {
        StudyRecord::new(
            id,
            "Lactate",
            TwoByTwo::new(table.0, table.1, table.2, table.3),
            ReportingForm::RawCounts,
            Covariates {
                age_group: age_group.map(str::to_string),
                ..Covariates::default()
            },
            0.5,
        )
    }

    fn outlier_cohort() -> BiomarkerCohort {
        BiomarkerCohort::new(
            "Lactate",
            vec![
                study("A", (40, 10, 5, 45), Some("adult")),
                study("B", (42, 8, 6, 44), Some("adult")),
                study("C", (38, 12, 5, 45), Some("adult")),
                study("D", (41, 9, 4, 46), Some("pediatric")),
                study("E", (39, 11, 6, 44), Some("pediatric")),
                study("Z", (10, 40, 5, 45), None),
            ],
        )
    }

    #[test]
    fn low_sensitivity_outlier_is_flagged() {
        let cohort = outlier_cohort();
        let config = AnalysisConfig {
            bootstrap_replicates: 50,
            ..AnalysisConfig::default()
        };
        let baseline = analyze_pooled(&cohort, &config).unwrap();
        assert_abs_diff_eq!(baseline.estimate.sensitivity.estimate, 0.7171, epsilon = 1e-3);

        let report = leave_one_out(&cohort, &baseline, &config).unwrap();
        assert_eq!(report.entries.len(), 6);
        let ids: Vec<_> = report.entries.iter().map(|e| e.omitted_study.as_str()).collect();
        assert_eq!(ids, vec!["A", "B", "C", "D", "E", "Z"]);

        assert!(report.entries.iter().all(|e| e.reduced().is_some()));
        let outlier = report.entries[5].reduced().unwrap();
        assert_abs_diff_eq!(outlier.sensitivity, 0.7985, epsilon = 1e-3);
        assert!(outlier.sensitivity_shift > 0.05);
        assert_eq!(outlier.i_squared_sensitivity, 0.0);
        assert!(outlier.reasons.contains(&InfluenceReason::SensitivityShift));
        assert!(outlier.reasons.contains(&InfluenceReason::SensitivityHeterogeneityHalved));

        let flagged: Vec<_> = report.influential().map(|e| e.omitted_study.as_str()).collect();
        assert_eq!(flagged, vec!["Z"]);
    }

    #[test]
    fn leave_one_out_needs_a_poolable_remainder() {
        let cohort = BiomarkerCohort::new(
            "Lactate",
            vec![
                study("A", (40, 10, 5, 45), None),
                study("B", (42, 8, 6, 44), None),
                study("C", (38, 12, 5, 45), None),
            ],
        );
        let config = AnalysisConfig::default();
        let baseline = analyze_pooled(&cohort, &config).unwrap();
        let err = leave_one_out(&cohort, &baseline, &config).unwrap_err();
        assert_eq!(err.stage, Stage::LeaveOneOut);
        assert_eq!(err.required, 4);
    }

    #[test]
    fn failed_re_pool_keeps_its_entry_with_a_reason() {
        let cohort = outlier_cohort();
        let config = AnalysisConfig {
            bootstrap_replicates: 0,
            ..AnalysisConfig::default()
        };
        let baseline = analyze_pooled(&cohort, &config).unwrap();
        let strict = AnalysisConfig {
            min_studies_pooling: 6,
            ..config.clone()
        };

        let entry = influence_entry(&cohort, 5, &baseline, &strict);
        assert_eq!(entry.omitted_study, "Z");
        assert!(entry.reduced().is_none());
        assert!(!entry.is_influential());
        match &entry.outcome {
            StageOutcome::Skipped { reason } => assert!(reason.contains("only 5"), "{}", reason),
            other => panic!("Expected a skipped entry, got {:?}", other),
        }

        let entry = influence_entry(&cohort, 5, &baseline, &config);
        assert!(entry.is_influential());
    }

    #[test]
    fn subgroups_are_ordered_and_small_ones_are_narrative() {
        let config = AnalysisConfig {
            bootstrap_replicates: 20,
            ..AnalysisConfig::default()
        };
        let results = analyze_subgroups(&outlier_cohort(), Covariate::AgeGroup, &config);
        let levels: Vec<_> = results.iter().map(|r| r.level.as_deref()).collect();
        assert_eq!(levels, vec![Some("adult"), Some("pediatric"), None]);

        match &results[0].outcome {
            SubgroupOutcome::Pooled { analysis } => {
                assert_eq!(analysis.estimate.n_studies, 3);
            }
            other => panic!("adult partition should pool, got {:?}", other),
        }
        assert_eq!(results[1].n_studies, 2);
        assert!(matches!(results[1].outcome, SubgroupOutcome::NarrativeOnly { .. }));
        assert_eq!(results[2].study_ids, vec!["Z".to_string()]);
        assert!(matches!(results[2].outcome, SubgroupOutcome::NarrativeOnly { .. }));
    }

    #[test]
    fn fixed_effect_matches_random_effect_without_heterogeneity() {
        let cohort = BiomarkerCohort::new(
            "Lactate",
            vec![
                study("A", (40, 10, 5, 45), None),
                study("B", (40, 10, 5, 45), None),
                study("C", (40, 10, 5, 45), None),
            ],
        );
        let config = AnalysisConfig::default();
        let random = pool_random_effects(&cohort, &config).unwrap();
        let comparison = compare_models(&cohort, &random, &config).unwrap();
        assert_abs_diff_eq!(comparison.sensitivity_difference, 0.0, epsilon = 1e-9);
        assert_abs_diff_eq!(comparison.specificity_difference, 0.0, epsilon = 1e-9);
        assert_abs_diff_eq!(
            comparison.fixed_effect.sensitivity.lower,
            random.sensitivity.lower,
            epsilon = 1e-9
        );
    }
}
