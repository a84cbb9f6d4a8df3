//! # Reporting
//!
//! Flattens a [`BatchReport`] into tab-separated tables, one row type per
//! file, and writes the full nested report as TOML next to them. Missing values
//! (skipped stages, narrative-only cohorts) are written as empty cells.

use crate::bias::BiasAssessment;
use crate::estimate::{FitFlag, VarianceMethod};
use crate::orchestrate::{InfluenceEntry, StageOutcome, SubgroupOutcome};
use crate::pipeline::{BatchReport, BiomarkerReport, CohortOutcome};
use crate::regression::OutcomeRegression;
use crate::validate::{ValidationReport, ValidationStatus};
use itertools::Itertools;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("IO error while writing the report: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to write a delimited table: {0}")]
    CsvError(#[from] csv::Error),
    #[error("Failed to serialize the report to TOML: {0}")]
    TomlError(#[from] toml::ser::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SummaryRow {
    pub biomarker: String,
    pub n_studies: usize,
    pub total_diseased: u64,
    pub total_controls: u64,
    pub status: &'static str,
    pub method: Option<String>,
    pub sensitivity: Option<f64>,
    pub sensitivity_lower: Option<f64>,
    pub sensitivity_upper: Option<f64>,
    pub specificity: Option<f64>,
    pub specificity_lower: Option<f64>,
    pub specificity_upper: Option<f64>,
    pub diagnostic_odds_ratio: Option<f64>,
    pub dor_lower: Option<f64>,
    pub dor_upper: Option<f64>,
    pub lr_positive: Option<f64>,
    pub lr_negative: Option<f64>,
    pub i_squared_sensitivity: Option<f64>,
    pub i_squared_specificity: Option<f64>,
    pub tau2_sensitivity: Option<f64>,
    pub tau2_specificity: Option<f64>,
    pub correlation: Option<f64>,
    pub sroc_auc: Option<f64>,
    pub sroc_auc_lower: Option<f64>,
    pub sroc_auc_upper: Option<f64>,
    pub sroc_reliable: Option<bool>,
    pub bias_p_value: Option<f64>,
    pub evidence_grade: Option<String>,
    pub flags: String,
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StudyMetricsRow {
    pub biomarker: String,
    pub study_id: String,
    pub form: String,
    pub continuity_corrected: bool,
    pub n_diseased: u64,
    pub n_controls: u64,
    pub sensitivity: f64,
    pub sensitivity_lower: f64,
    pub sensitivity_upper: f64,
    pub specificity: f64,
    pub specificity_lower: f64,
    pub specificity_upper: f64,
    pub diagnostic_odds_ratio: f64,
    pub dor_lower: f64,
    pub dor_upper: f64,
    pub lr_positive: f64,
    pub lr_negative: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubgroupRow {
    pub biomarker: String,
    pub covariate: String,
    pub level: String,
    pub n_studies: usize,
    pub status: &'static str,
    pub sensitivity: Option<f64>,
    pub sensitivity_lower: Option<f64>,
    pub sensitivity_upper: Option<f64>,
    pub specificity: Option<f64>,
    pub specificity_lower: Option<f64>,
    pub specificity_upper: Option<f64>,
    pub i_squared_sensitivity: Option<f64>,
    pub i_squared_specificity: Option<f64>,
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InfluenceRow {
    pub biomarker: String,
    pub omitted_study: String,
    pub sensitivity: Option<f64>,
    pub specificity: Option<f64>,
    pub sensitivity_shift: Option<f64>,
    pub specificity_shift: Option<f64>,
    pub i_squared_sensitivity: Option<f64>,
    pub i_squared_specificity: Option<f64>,
    pub influential: bool,
    pub reasons: String,
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegressionRow {
    pub biomarker: String,
    pub covariate: String,
    pub outcome: Option<&'static str>,
    pub term: Option<String>,
    pub estimate: Option<f64>,
    pub standard_error: Option<f64>,
    pub z: Option<f64>,
    pub p_value: Option<f64>,
    pub tau_squared: Option<f64>,
    pub residual_q: Option<f64>,
    pub residual_df: Option<usize>,
    pub residual_p_value: Option<f64>,
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationRow {
    pub row: usize,
    pub study_id: String,
    pub biomarker: String,
    pub form: Option<String>,
    pub status: &'static str,
    pub detail: Option<String>,
}

fn flag_list(flags: &[FitFlag]) -> String {
    flags
        .iter()
        .map(|f| match f {
            FitFlag::ConvergenceFallback => "convergence_fallback",
            FitFlag::CorrelationShrunk => "correlation_shrunk",
            FitFlag::DegenerateVarianceFallback => "degenerate_variance_fallback",
        })
        .join(",")
}

pub fn summary_row(report: &BiomarkerReport) -> SummaryRow {
    let mut row = SummaryRow {
        biomarker: report.biomarker.clone(),
        n_studies: report.n_studies,
        total_diseased: report.total_diseased,
        total_controls: report.total_controls,
        status: "narrative_only",
        method: None,
        sensitivity: None,
        sensitivity_lower: None,
        sensitivity_upper: None,
        specificity: None,
        specificity_lower: None,
        specificity_upper: None,
        diagnostic_odds_ratio: None,
        dor_lower: None,
        dor_upper: None,
        lr_positive: None,
        lr_negative: None,
        i_squared_sensitivity: None,
        i_squared_specificity: None,
        tau2_sensitivity: None,
        tau2_specificity: None,
        correlation: None,
        sroc_auc: None,
        sroc_auc_lower: None,
        sroc_auc_upper: None,
        sroc_reliable: None,
        bias_p_value: report.publication_bias.test().map(|t| t.p_value),
        evidence_grade: None,
        flags: String::new(),
        note: None,
    };

    let pooled = match &report.outcome {
        CohortOutcome::NarrativeOnly { reason } => {
            row.note = Some(reason.clone());
            return row;
        }
        CohortOutcome::Pooled { report } => report,
    };
    let estimate = &pooled.analysis.estimate;
    let heterogeneity = &pooled.analysis.heterogeneity;
    row.status = "pooled";
    row.method = Some(
        match estimate.method {
            VarianceMethod::Reml => "reml",
            VarianceMethod::MethodOfMoments => "method_of_moments",
            VarianceMethod::FixedEffect => "fixed_effect",
        }
        .to_string(),
    );
    row.sensitivity = Some(estimate.sensitivity.estimate);
    row.sensitivity_lower = Some(estimate.sensitivity.lower);
    row.sensitivity_upper = Some(estimate.sensitivity.upper);
    row.specificity = Some(estimate.specificity.estimate);
    row.specificity_lower = Some(estimate.specificity.lower);
    row.specificity_upper = Some(estimate.specificity.upper);
    row.diagnostic_odds_ratio = Some(estimate.diagnostic_odds_ratio.estimate);
    row.dor_lower = Some(estimate.diagnostic_odds_ratio.lower);
    row.dor_upper = Some(estimate.diagnostic_odds_ratio.upper);
    row.lr_positive = Some(estimate.positive_likelihood_ratio.estimate);
    row.lr_negative = Some(estimate.negative_likelihood_ratio.estimate);
    row.i_squared_sensitivity = Some(heterogeneity.sensitivity.i_squared);
    row.i_squared_specificity = Some(heterogeneity.specificity.i_squared);
    row.tau2_sensitivity = Some(estimate.between_study.tau2_sens);
    row.tau2_specificity = Some(estimate.between_study.tau2_spec);
    row.correlation = Some(estimate.between_study_correlation);
    row.evidence_grade = Some(pooled.evidence_grade.to_string());
    row.flags = flag_list(&estimate.flags);
    match &pooled.analysis.sroc {
        StageOutcome::Completed { result } => {
            row.sroc_auc = Some(result.normalized_auc);
            row.sroc_auc_lower = result.auc_interval.map(|i| i.lower);
            row.sroc_auc_upper = result.auc_interval.map(|i| i.upper);
            row.sroc_reliable = Some(result.reliability.is_reliable());
        }
        StageOutcome::Skipped { reason } => row.note = Some(format!("SROC: {}", reason)),
    }
    row
}

fn study_rows(report: &BiomarkerReport) -> Vec<StudyMetricsRow> {
    report
        .studies
        .iter()
        .map(|m| StudyMetricsRow {
            biomarker: report.biomarker.clone(),
            study_id: m.study_id.clone(),
            form: m.form.to_string(),
            continuity_corrected: m.continuity_corrected,
            n_diseased: m.n_diseased,
            n_controls: m.n_controls,
            sensitivity: m.sensitivity.estimate,
            sensitivity_lower: m.sensitivity.lower,
            sensitivity_upper: m.sensitivity.upper,
            specificity: m.specificity.estimate,
            specificity_lower: m.specificity.lower,
            specificity_upper: m.specificity.upper,
            diagnostic_odds_ratio: m.diagnostic_odds_ratio.estimate,
            dor_lower: m.diagnostic_odds_ratio.lower,
            dor_upper: m.diagnostic_odds_ratio.upper,
            lr_positive: m.positive_likelihood_ratio,
            lr_negative: m.negative_likelihood_ratio,
        })
        .collect()
}

fn subgroup_rows(report: &BiomarkerReport) -> Vec<SubgroupRow> {
    let Some(pooled) = report.pooled() else {
        return Vec::new();
    };
    pooled
        .subgroups
        .iter()
        .map(|s| {
            let mut row = SubgroupRow {
                biomarker: report.biomarker.clone(),
                covariate: s.covariate.to_string(),
                level: s.level.clone().unwrap_or_else(|| "(not reported)".to_string()),
                n_studies: s.n_studies,
                status: "narrative_only",
                sensitivity: None,
                sensitivity_lower: None,
                sensitivity_upper: None,
                specificity: None,
                specificity_lower: None,
                specificity_upper: None,
                i_squared_sensitivity: None,
                i_squared_specificity: None,
                note: None,
            };
            match &s.outcome {
                SubgroupOutcome::NarrativeOnly { reason } => row.note = Some(reason.clone()),
                SubgroupOutcome::Pooled { analysis } => {
                    let e = &analysis.estimate;
                    row.status = "pooled";
                    row.sensitivity = Some(e.sensitivity.estimate);
                    row.sensitivity_lower = Some(e.sensitivity.lower);
                    row.sensitivity_upper = Some(e.sensitivity.upper);
                    row.specificity = Some(e.specificity.estimate);
                    row.specificity_lower = Some(e.specificity.lower);
                    row.specificity_upper = Some(e.specificity.upper);
                    row.i_squared_sensitivity = Some(analysis.heterogeneity.sensitivity.i_squared);
                    row.i_squared_specificity = Some(analysis.heterogeneity.specificity.i_squared);
                }
            }
            row
        })
        .collect()
}

fn influence_rows(report: &BiomarkerReport) -> Vec<InfluenceRow> {
    let Some(loo) = report.pooled().and_then(|p| p.leave_one_out.completed()) else {
        return Vec::new();
    };
    loo.entries
        .iter()
        .map(|e| influence_row(&report.biomarker, e))
        .collect()
}

fn influence_row(biomarker: &str, entry: &InfluenceEntry) -> InfluenceRow {
    let mut row = InfluenceRow {
        biomarker: biomarker.to_string(),
        omitted_study: entry.omitted_study.clone(),
        sensitivity: None,
        specificity: None,
        sensitivity_shift: None,
        specificity_shift: None,
        i_squared_sensitivity: None,
        i_squared_specificity: None,
        influential: entry.is_influential(),
        reasons: String::new(),
        note: None,
    };
    match &entry.outcome {
        StageOutcome::Completed { result } => {
            row.sensitivity = Some(result.sensitivity);
            row.specificity = Some(result.specificity);
            row.sensitivity_shift = Some(result.sensitivity_shift);
            row.specificity_shift = Some(result.specificity_shift);
            row.i_squared_sensitivity = Some(result.i_squared_sensitivity);
            row.i_squared_specificity = Some(result.i_squared_specificity);
            row.reasons = result.reasons.iter().map(|r| format!("{:?}", r)).join(",");
        }
        StageOutcome::Skipped { reason } => row.note = Some(reason.clone()),
    }
    row
}

fn regression_rows(report: &BiomarkerReport) -> Vec<RegressionRow> {
    let Some(pooled) = report.pooled() else {
        return Vec::new();
    };
    let mut rows = Vec::new();
    for entry in &pooled.meta_regressions {
        let blank = RegressionRow {
            biomarker: report.biomarker.clone(),
            covariate: entry.covariate.to_string(),
            outcome: None,
            term: None,
            estimate: None,
            standard_error: None,
            z: None,
            p_value: None,
            tau_squared: None,
            residual_q: None,
            residual_df: None,
            residual_p_value: None,
            note: None,
        };
        match &entry.outcome {
            StageOutcome::Skipped { reason } => rows.push(RegressionRow {
                note: Some(reason.clone()),
                ..blank
            }),
            StageOutcome::Completed { result } => {
                let outcomes: [(&'static str, &OutcomeRegression); 2] = [
                    ("sensitivity", &result.sensitivity),
                    ("specificity", &result.specificity),
                ];
                for (name, fit) in outcomes {
                    for c in &fit.coefficients {
                        rows.push(RegressionRow {
                            outcome: Some(name),
                            term: Some(c.term.clone()),
                            estimate: Some(c.estimate),
                            standard_error: Some(c.standard_error),
                            z: Some(c.z),
                            p_value: Some(c.p_value),
                            tau_squared: Some(fit.tau_squared),
                            residual_q: Some(fit.residual_q),
                            residual_df: Some(fit.residual_df),
                            residual_p_value: Some(fit.residual_p_value),
                            ..blank.clone()
                        });
                    }
                }
            }
        }
    }
    rows
}

fn validation_rows(validation: &ValidationReport) -> Vec<ValidationRow> {
    validation
        .log
        .iter()
        .map(|entry| {
            let (status, detail) = match &entry.status {
                ValidationStatus::Uncorrected => ("uncorrected", None),
                ValidationStatus::Corrected { magnitude } => {
                    ("corrected", Some(format!("added {} to every cell", magnitude)))
                }
                ValidationStatus::Rejected { reason } => ("rejected", Some(reason.clone())),
            };
            ValidationRow {
                row: entry.row,
                study_id: entry.study_id.clone(),
                biomarker: entry.biomarker.clone(),
                form: entry.form.map(|f| f.to_string()),
                status,
                detail,
            }
        })
        .collect()
}

/// Writes `rows` as a tab-separated table with a header row.
pub fn write_table<T: Serialize>(path: &Path, rows: &[T]) -> Result<(), ReportError> {
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_path(path)?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

/// Writes one row per input entry with its validation outcome.
pub fn write_validation_log(validation: &ValidationReport, path: &Path) -> Result<(), ReportError> {
    write_table(path, &validation_rows(validation))
}

/// Writes every table and `report.toml` into `out_dir`, returning the paths written.
pub fn write_report(report: &BatchReport, out_dir: &Path) -> Result<Vec<PathBuf>, ReportError> {
    fs::create_dir_all(out_dir)?;
    let mut written = Vec::new();
    let mut emit = |name: &str| {
        let path = out_dir.join(name);
        written.push(path.clone());
        path
    };

    let summary: Vec<SummaryRow> = report.biomarkers.iter().map(summary_row).collect();
    write_table(&emit("summary.tsv"), &summary)?;
    let studies: Vec<_> = report.biomarkers.iter().flat_map(study_rows).collect();
    write_table(&emit("studies.tsv"), &studies)?;
    let subgroups: Vec<_> = report.biomarkers.iter().flat_map(subgroup_rows).collect();
    write_table(&emit("subgroups.tsv"), &subgroups)?;
    let influence: Vec<_> = report.biomarkers.iter().flat_map(influence_rows).collect();
    write_table(&emit("leave_one_out.tsv"), &influence)?;
    let regressions: Vec<_> = report.biomarkers.iter().flat_map(regression_rows).collect();
    write_table(&emit("meta_regression.tsv"), &regressions)?;
    write_validation_log(&report.validation, &emit("validation.tsv"))?;

    let toml_path = emit("report.toml");
    fs::write(&toml_path, toml::to_string(report)?)?;

    for path in &written {
        log::info!("Wrote {}", path.display());
    }
    Ok(written)
}

/// One-line verdict on publication bias for console output.
pub fn bias_verdict(assessment: &BiasAssessment) -> String {
    match assessment {
        BiasAssessment::Tested { test } if test.asymmetric => {
            format!("funnel asymmetry detected (p = {:.4})", test.p_value)
        }
        BiasAssessment::Tested { test } => format!("no funnel asymmetry (p = {:.4})", test.p_value),
        BiasAssessment::InsufficientPower { warning } => warning.to_string(),
        BiasAssessment::NoPrecisionSpread => "not testable (equal study sizes)".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AnalysisConfig;
    use crate::pipeline::analyze_batch;
    use crate::validate::RawStudyEntry;
    use tempfile::tempdir;

    fn entry(biomarker: &str, id: &str, table: (i64, i64, i64, i64), condition: &str) -> RawStudyEntry {
        RawStudyEntry {
            study_id: id.to_string(),
            biomarker: biomarker.to_string(),
            true_pos: Some(table.0),
            false_neg: Some(table.1),
            false_pos: Some(table.2),
            true_neg: Some(table.3),
            condition: Some(condition.to_string()),
            ..RawStudyEntry::default()
        }
    }

    fn sample_report() -> BatchReport {
        let entries = vec![
            entry("FGF-21", "A", (40, 10, 5, 45), "mitochondrial"),
            entry("FGF-21", "B", (42, 8, 6, 44), "mitochondrial"),
            entry("FGF-21", "C", (38, 12, 5, 45), "mitochondrial"),
            entry("FGF-21", "D", (41, 9, 4, 46), "neuromuscular"),
            entry("FGF-21", "E", (10, 40, 5, 45), "neuromuscular"),
            entry("GDF-15", "G", (30, 0, 5, 45), "mitochondrial"),
        ];
        let config = AnalysisConfig {
            bootstrap_replicates: 20,
            ..AnalysisConfig::default()
        };
        analyze_batch(&entries, &config).unwrap()
    }

    #[test]
    fn skipped_influence_entry_keeps_its_row_with_a_note() {
        let entry = InfluenceEntry {
            omitted_study: "C".to_string(),
            outcome: StageOutcome::Skipped {
                reason: "Pooling requires at least 3 studies, but only 2 are available.".to_string(),
            },
        };
        let row = influence_row("FGF-21", &entry);
        assert_eq!(row.omitted_study, "C");
        assert_eq!(row.sensitivity, None);
        assert_eq!(row.sensitivity_shift, None);
        assert!(!row.influential);
        assert!(row.reasons.is_empty());
        assert!(row.note.as_deref().is_some_and(|n| n.contains("only 2")));

        let report = sample_report();
        let pooled = report.biomarkers[0].pooled().unwrap();
        let loo = pooled.leave_one_out.completed().unwrap();
        let outlier = influence_row("FGF-21", &loo.entries[4]);
        assert_eq!(outlier.omitted_study, "E");
        assert!(outlier.sensitivity.is_some());
        assert!(outlier.influential);
        assert!(outlier.reasons.contains("SensitivityShift"));
        assert_eq!(outlier.note, None);
    }

    #[test]
    fn summary_rows_distinguish_pooled_and_narrative() {
        let report = sample_report();
        let rows: Vec<_> = report.biomarkers.iter().map(summary_row).collect();
        assert_eq!(rows[0].status, "pooled");
        assert!(rows[0].sensitivity.is_some());
        assert!(matches!(rows[0].method.as_deref(), Some("reml" | "method_of_moments")));
        assert_eq!(rows[1].status, "narrative_only");
        assert!(rows[1].sensitivity.is_none());
        assert!(rows[1].note.as_deref().unwrap().contains("at least 3"));
    }

    #[test]
    fn every_file_is_written_and_readable() {
        let report = sample_report();
        let dir = tempdir().unwrap();
        let written = write_report(&report, dir.path()).unwrap();
        assert_eq!(written.len(), 7);
        for path in &written {
            assert!(path.exists(), "{} missing", path.display());
        }

        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .from_path(dir.path().join("summary.tsv"))
            .unwrap();
        let headers = reader.headers().unwrap().clone();
        assert_eq!(&headers[0], "biomarker");
        assert!(headers.iter().any(|h| h == "evidence_grade"));
        let records: Vec<_> = reader.records().map(Result::unwrap).collect();
        assert_eq!(records.len(), 2);
        assert_eq!(&records[0][0], "FGF-21");

        let studies = fs::read_to_string(dir.path().join("studies.tsv")).unwrap();
        assert_eq!(studies.lines().count(), 1 + 6);

        let loo = fs::read_to_string(dir.path().join("leave_one_out.tsv")).unwrap();
        assert_eq!(loo.lines().count(), 1 + 5);

        let validation = fs::read_to_string(dir.path().join("validation.tsv")).unwrap();
        assert!(validation.contains("corrected"));

        let text = fs::read_to_string(dir.path().join("report.toml")).unwrap();
        let parsed: toml::Value = toml::from_str(&text).unwrap();
        let biomarkers = parsed.get("biomarkers").and_then(|b| b.as_array()).unwrap();
        assert_eq!(biomarkers.len(), 2);
    }

    #[test]
    fn skipped_regressions_keep_their_reason() {
        let report = sample_report();
        let rows = regression_rows(&report.biomarkers[0]);
        let year = rows.iter().find(|r| r.covariate == "publication_year").unwrap();
        assert!(year.term.is_none());
        assert!(year.note.as_deref().unwrap().contains("requires at least 5"));
        assert!(rows.iter().any(|r| r.term.as_deref() == Some("condition=neuromuscular")));
    }
}
