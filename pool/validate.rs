// ========================================================================================
//
//                          THE RECORD VALIDATOR & RECONCILER
//
// ========================================================================================
//
// Turns heterogeneous per-study entries into complete 2×2 tables. Each entry is
// first classified into one of the reporting forms of `ReportedAccuracy`, then
// reconciled into integer counts, then wrapped into an immutable `StudyRecord`
// with its continuity correction decided per study. A rejected entry never
// stops the batch: it is logged and left out of the accepted set.

use crate::config::AnalysisConfig;
use crate::types::{
    ContinuityCorrection, Covariates, ReportedAccuracy, ReportingForm, StudyRecord, TwoByTwo,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

/// One per-study entry exactly as handed over by the extraction collaborator.
/// Every accuracy field is optional; which ones are present decides the
/// reporting form.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawStudyEntry {
    pub study_id: String,
    pub biomarker: String,
    #[serde(rename = "tp")]
    pub true_pos: Option<i64>,
    #[serde(rename = "fp")]
    pub false_pos: Option<i64>,
    #[serde(rename = "fn")]
    pub false_neg: Option<i64>,
    #[serde(rename = "tn")]
    pub true_neg: Option<i64>,
    pub sensitivity: Option<f64>,
    pub specificity: Option<f64>,
    pub n_diseased: Option<i64>,
    pub n_controls: Option<i64>,
    pub sens_ci_lower: Option<f64>,
    pub sens_ci_upper: Option<f64>,
    pub spec_ci_lower: Option<f64>,
    pub spec_ci_upper: Option<f64>,
    pub age_group: Option<String>,
    pub condition: Option<String>,
    pub assay_platform: Option<String>,
    pub publication_year: Option<i32>,
    pub quality_tier: Option<String>,
    pub cutoff: Option<f64>,
    pub population: Option<String>,
}

/// Why a single entry could not be reconciled into a valid 2×2 table.
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
pub enum ValidationFailure {
    #[error("The row could not be parsed: {0}")]
    Unparseable(String),
    #[error("The study identifier is empty.")]
    MissingStudyId,
    #[error("The biomarker name is empty.")]
    MissingBiomarker,
    #[error("Raw counts are incomplete; missing: {0}.")]
    IncompleteCounts(String),
    #[error("The {0} count is negative.")]
    NegativeCount(&'static str),
    #[error("The {0} group has no subjects.")]
    EmptyGroup(&'static str),
    #[error("The {group} group reports {reported} subjects but its counts sum to {derived}.")]
    TotalsMismatch {
        group: &'static str,
        reported: u64,
        derived: u64,
    },
    #[error("Reported {measure} {value} lies outside [0, 1].")]
    ProportionOutOfRange { measure: &'static str, value: f64 },
    #[error("The {measure} interval [{lower}, {upper}] is not a valid interval around the estimate.")]
    InvalidInterval {
        measure: &'static str,
        lower: f64,
        upper: f64,
    },
    #[error(
        "No sample size can be recovered from the {measure} interval (estimate at a boundary or zero-width interval)."
    )]
    IntervalNotInvertible { measure: &'static str },
    #[error(
        "Neither raw counts, nor proportions with sample sizes, nor proportions with intervals are available."
    )]
    NotReconstructible,
    #[error("Study '{0}' appears more than once for this biomarker.")]
    DuplicateStudy(String),
}

/// A study that was rejected, with the reason.
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
#[error("Study '{study_id}' ({biomarker}) rejected: {reason}")]
pub struct DataValidationError {
    pub study_id: String,
    pub biomarker: String,
    pub reason: ValidationFailure,
}

/// Outcome recorded for each input row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ValidationStatus {
    Uncorrected,
    Corrected { magnitude: f64 },
    Rejected { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationEntry {
    /// One-based position of the entry in the input.
    pub row: usize,
    pub study_id: String,
    pub biomarker: String,
    pub form: Option<ReportingForm>,
    pub status: ValidationStatus,
}

/// The accepted records and one log entry per input row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub accepted: Vec<StudyRecord>,
    pub log: Vec<ValidationEntry>,
}

impl ValidationReport {
    pub fn rejected_count(&self) -> usize {
        self.log
            .iter()
            .filter(|e| matches!(e.status, ValidationStatus::Rejected { .. }))
            .count()
    }

    pub fn corrected_count(&self) -> usize {
        self.log
            .iter()
            .filter(|e| matches!(e.status, ValidationStatus::Corrected { .. }))
            .count()
    }
}

impl RawStudyEntry {
    fn covariates(&self) -> Covariates {
        Covariates {
            age_group: self.age_group.clone(),
            condition: self.condition.clone(),
            assay_platform: self.assay_platform.clone(),
            publication_year: self.publication_year,
            quality_tier: self.quality_tier.clone(),
            cutoff: self.cutoff,
            population: self.population.clone(),
        }
    }

    /// Decides which reporting form the entry carries. Raw counts take
    /// precedence over proportions with sample sizes, which take precedence
    /// over proportions with intervals.
    pub fn classify(&self) -> Result<ReportedAccuracy, ValidationFailure> {
        let cells = [
            ("TP", self.true_pos),
            ("FN", self.false_neg),
            ("FP", self.false_pos),
            ("TN", self.true_neg),
        ];
        if cells.iter().any(|(_, c)| c.is_some()) {
            let missing: Vec<&str> = cells
                .iter()
                .filter(|(_, c)| c.is_none())
                .map(|(name, _)| *name)
                .collect();
            if !missing.is_empty() {
                return Err(ValidationFailure::IncompleteCounts(missing.join(", ")));
            }
            let tp = non_negative("TP", self.true_pos)?;
            let fn_count = non_negative("FN", self.false_neg)?;
            let fp = non_negative("FP", self.false_pos)?;
            let tn = non_negative("TN", self.true_neg)?;
            return Ok(ReportedAccuracy::RawCounts(TwoByTwo::new(
                tp, fn_count, fp, tn,
            )));
        }

        let (sensitivity, specificity) = match (self.sensitivity, self.specificity) {
            (Some(se), Some(sp)) => (
                proportion("sensitivity", se)?,
                proportion("specificity", sp)?,
            ),
            _ => return Err(ValidationFailure::NotReconstructible),
        };

        if let (Some(nd), Some(nc)) = (self.n_diseased, self.n_controls) {
            return Ok(ReportedAccuracy::ProportionsWithN {
                sensitivity,
                specificity,
                n_diseased: non_negative("diseased total", Some(nd))?,
                n_controls: non_negative("control total", Some(nc))?,
            });
        }

        match (
            self.sens_ci_lower,
            self.sens_ci_upper,
            self.spec_ci_lower,
            self.spec_ci_upper,
        ) {
            (Some(sl), Some(su), Some(pl), Some(pu)) => Ok(ReportedAccuracy::ProportionsWithCi {
                sensitivity,
                specificity,
                sensitivity_ci: interval("sensitivity", sensitivity, sl, su)?,
                specificity_ci: interval("specificity", specificity, pl, pu)?,
            }),
            _ => Err(ValidationFailure::NotReconstructible),
        }
    }
}

fn non_negative(name: &'static str, value: Option<i64>) -> Result<u64, ValidationFailure> {
    match value {
        Some(v) if v >= 0 => Ok(v as u64),
        Some(..) => Err(ValidationFailure::NegativeCount(name)),
        None => Err(ValidationFailure::NotReconstructible),
    }
}

fn proportion(measure: &'static str, value: f64) -> Result<f64, ValidationFailure> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(value)
    } else {
        Err(ValidationFailure::ProportionOutOfRange { measure, value })
    }
}

fn interval(
    measure: &'static str,
    estimate: f64,
    lower: f64,
    upper: f64,
) -> Result<(f64, f64), ValidationFailure> {
    let in_unit = |x: f64| x.is_finite() && (0.0..=1.0).contains(&x);
    if in_unit(lower) && in_unit(upper) && lower <= estimate && estimate <= upper {
        Ok((lower, upper))
    } else {
        Err(ValidationFailure::InvalidInterval {
            measure,
            lower,
            upper,
        })
    }
}

/// Recovers the sample size behind a Wald interval, `n = z² p(1-p) / h²`.
///
/// One side of the interval may have been clipped to [0, 1] by the reporting
/// study, so the wider half-width is used.
pub fn sample_size_from_interval(
    measure: &'static str,
    estimate: f64,
    ci: (f64, f64),
    z: f64,
) -> Result<u64, ValidationFailure> {
    let half_width = (estimate - ci.0).max(ci.1 - estimate);
    let spread = estimate * (1.0 - estimate);
    if half_width <= 0.0 || spread <= 0.0 {
        return Err(ValidationFailure::IntervalNotInvertible { measure });
    }
    let n = (z * z * spread / (half_width * half_width)).round();
    if n.is_finite() && n >= 1.0 {
        Ok(n as u64)
    } else {
        Err(ValidationFailure::IntervalNotInvertible { measure })
    }
}

/// Rebuilds a complete table from proportions and group sizes:
/// `TP = round(sens × N_d)`, `TN = round(spec × N_c)`.
pub fn table_from_proportions(
    sensitivity: f64,
    specificity: f64,
    n_diseased: u64,
    n_controls: u64,
) -> TwoByTwo {
    let tp = ((sensitivity * n_diseased as f64).round() as u64).min(n_diseased);
    let tn = ((specificity * n_controls as f64).round() as u64).min(n_controls);
    TwoByTwo::new(tp, n_diseased - tp, n_controls - tn, tn)
}

/// Reconciles a classified entry into a complete integer table.
pub fn reconcile(
    accuracy: &ReportedAccuracy,
    z: f64,
    reported_totals: (Option<i64>, Option<i64>),
) -> Result<TwoByTwo, ValidationFailure> {
    let table = match accuracy {
        ReportedAccuracy::RawCounts(table) => {
            check_total("diseased", reported_totals.0, table.diseased())?;
            check_total("control", reported_totals.1, table.controls())?;
            *table
        }
        ReportedAccuracy::ProportionsWithN {
            sensitivity,
            specificity,
            n_diseased,
            n_controls,
        } => table_from_proportions(*sensitivity, *specificity, *n_diseased, *n_controls),
        ReportedAccuracy::ProportionsWithCi {
            sensitivity,
            specificity,
            sensitivity_ci,
            specificity_ci,
        } => {
            let nd = sample_size_from_interval("sensitivity", *sensitivity, *sensitivity_ci, z)?;
            let nc = sample_size_from_interval("specificity", *specificity, *specificity_ci, z)?;
            table_from_proportions(*sensitivity, *specificity, nd, nc)
        }
    };
    if table.diseased() == 0 {
        return Err(ValidationFailure::EmptyGroup("diseased"));
    }
    if table.controls() == 0 {
        return Err(ValidationFailure::EmptyGroup("control"));
    }
    Ok(table)
}

fn check_total(group: &'static str, reported: Option<i64>, derived: u64) -> Result<(), ValidationFailure> {
    match reported {
        Some(r) if r < 0 || r as u64 != derived => Err(ValidationFailure::TotalsMismatch {
            group,
            reported: r.max(0) as u64,
            derived,
        }),
        _ => Ok(()),
    }
}

/// Validates one entry into an immutable [`StudyRecord`].
pub fn validate_entry(
    entry: &RawStudyEntry,
    config: &AnalysisConfig,
) -> Result<StudyRecord, DataValidationError> {
    let reject = |reason: ValidationFailure| DataValidationError {
        study_id: entry.study_id.clone(),
        biomarker: entry.biomarker.clone(),
        reason,
    };
    if entry.study_id.trim().is_empty() {
        return Err(reject(ValidationFailure::MissingStudyId));
    }
    if entry.biomarker.trim().is_empty() {
        return Err(reject(ValidationFailure::MissingBiomarker));
    }
    let accuracy = entry.classify().map_err(reject)?;
    let table = reconcile(
        &accuracy,
        config.z_critical(),
        (entry.n_diseased, entry.n_controls),
    )
    .map_err(reject)?;
    Ok(StudyRecord::new(
        entry.study_id.trim(),
        entry.biomarker.trim(),
        table,
        accuracy.form(),
        entry.covariates(),
        config.continuity_correction,
    ))
}

/// Validates every row. Rows that failed to parse upstream arrive as `Err`
/// and are logged as rejections alongside the entries that fail here.
pub fn validate_rows(
    rows: Vec<Result<RawStudyEntry, DataValidationError>>,
    config: &AnalysisConfig,
) -> ValidationReport {
    let mut report = ValidationReport::default();
    let mut seen: HashSet<(String, String)> = HashSet::new();

    for (index, row) in rows.into_iter().enumerate() {
        let row_number = index + 1;
        let outcome = row.and_then(|entry| {
            let record = validate_entry(&entry, config)?;
            let key = (record.biomarker.clone(), record.study_id.clone());
            if seen.insert(key) {
                Ok(record)
            } else {
                Err(DataValidationError {
                    study_id: record.study_id.clone(),
                    biomarker: record.biomarker.clone(),
                    reason: ValidationFailure::DuplicateStudy(record.study_id),
                })
            }
        });

        match outcome {
            Ok(record) => {
                let status = match record.correction {
                    ContinuityCorrection::Applied { magnitude } => {
                        log::debug!(
                            "Study '{}' ({}) has a zero cell; continuity correction of {} applied.",
                            record.study_id,
                            record.biomarker,
                            magnitude
                        );
                        ValidationStatus::Corrected { magnitude }
                    }
                    ContinuityCorrection::NotNeeded => ValidationStatus::Uncorrected,
                };
                report.log.push(ValidationEntry {
                    row: row_number,
                    study_id: record.study_id.clone(),
                    biomarker: record.biomarker.clone(),
                    form: Some(record.form),
                    status,
                });
                report.accepted.push(record);
            }
            Err(err) => {
                log::warn!("Row {}: {}", row_number, err);
                report.log.push(ValidationEntry {
                    row: row_number,
                    study_id: err.study_id.clone(),
                    biomarker: err.biomarker.clone(),
                    form: None,
                    status: ValidationStatus::Rejected {
                        reason: err.reason.to_string(),
                    },
                });
            }
        }
    }

    log::info!(
        "Validation finished: {} accepted ({} continuity-corrected), {} rejected.",
        report.accepted.len(),
        report.corrected_count(),
        report.rejected_count()
    );
    report
}

/// Convenience wrapper over [`validate_rows`] for in-memory entries.
pub fn validate_batch(entries: &[RawStudyEntry], config: &AnalysisConfig) -> ValidationReport {
    validate_rows(entries.iter().cloned().map(Ok).collect(), config)
}
