//! # Data Loading Module
//!
//! The only entry point for user-provided study tables. A table is read with
//! the `csv` crate (tab-delimited, or comma-delimited for `.csv` files) and
//! every row is deserialized into a [`RawStudyEntry`].
//!
//! - Strict schema: column names are fixed. `study_id` and `biomarker` must be
//!   present; every accuracy and covariate column is optional.
//! - Row-level failures do not abort the load. A row that cannot be parsed is
//!   handed on as a rejection so that it shows up in the validation log.
//! - A row with more or fewer fields than the header is one such rejection.
//! - File-level failures (missing file, unreadable header, missing required
//!   column) are a [`DataError`].

use crate::validate::{DataValidationError, RawStudyEntry, ValidationFailure};
use csv::{ReaderBuilder, StringRecord, Trim};
use std::path::Path;
use thiserror::Error;

const REQUIRED_COLUMNS: [&str; 2] = ["study_id", "biomarker"];

/// Cell values that mean "not reported".
const MISSING_MARKERS: [&str; 4] = ["na", "nan", "n/a", "."];

#[derive(Error, Debug)]
pub enum DataError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Error from the CSV reader: {0}")]
    CsvError(#[from] csv::Error),
    #[error(
        "The required column '{0}' was not found in the input file. Please check spelling and case."
    )]
    ColumnNotFound(String),
    #[error("The input file contains no study rows.")]
    NoRows,
}

/// One input row: a parsed entry or a rejection explaining why it could not be parsed.
pub type IngestedRow = Result<RawStudyEntry, DataValidationError>;

/// Reads every row of a study table.
pub fn load_study_table(path: &Path) -> Result<Vec<IngestedRow>, DataError> {
    let delimiter = match path.extension().and_then(|e| e.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("csv") => b',',
        _ => b'\t',
    };
    let mut reader = ReaderBuilder::new()
        .delimiter(delimiter)
        .trim(Trim::All)
        .flexible(true)
        .from_path(path)?;

    let headers = reader.headers()?.clone();
    for column in REQUIRED_COLUMNS {
        if !headers.iter().any(|h| h == column) {
            return Err(DataError::ColumnNotFound(column.to_string()));
        }
    }
    let position = |name: &str| headers.iter().position(|h| h == name);
    let id_col = position("study_id");
    let biomarker_col = position("biomarker");

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = match record {
            Ok(record) => normalize_missing(&record),
            Err(err) => {
                rows.push(Err(DataValidationError {
                    study_id: String::new(),
                    biomarker: String::new(),
                    reason: ValidationFailure::Unparseable(err.to_string()),
                }));
                continue;
            }
        };
        let reject = |reason: String| DataValidationError {
            study_id: field(&record, id_col),
            biomarker: field(&record, biomarker_col),
            reason: ValidationFailure::Unparseable(reason),
        };
        let parsed = if record.len() != headers.len() {
            Err(reject(format!(
                "expected {} fields, found {}",
                headers.len(),
                record.len()
            )))
        } else {
            record
                .deserialize::<RawStudyEntry>(Some(&headers))
                .map_err(|err| reject(err.to_string()))
        };
        rows.push(parsed);
    }
    if rows.is_empty() {
        return Err(DataError::NoRows);
    }

    log::info!(
        "Loaded {} study rows from '{}'.",
        rows.len(),
        path.display()
    );
    Ok(rows)
}

fn normalize_missing(record: &StringRecord) -> StringRecord {
    record
        .iter()
        .map(|value| {
            if MISSING_MARKERS
                .iter()
                .any(|marker| value.eq_ignore_ascii_case(marker))
            {
                ""
            } else {
                value
            }
        })
        .collect()
}

fn field(record: &StringRecord, column: Option<usize>) -> String {
    column
        .and_then(|i| record.get(i))
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{Builder, NamedTempFile};

    fn table_file(suffix: &str, content: &str) -> NamedTempFile {
        let mut file = Builder::new().suffix(suffix).tempfile().unwrap();
        write!(file, "{}", content).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn tab_delimited_rows_with_mixed_forms_are_parsed() {
        let content = "study_id\tbiomarker\ttp\tfp\tfn\ttn\tsensitivity\tspecificity\tn_diseased\tn_controls\tage_group\tpublication_year\n\
                       Koene2014\tFGF-21\t56\t10\t14\t60\t\t\t\t\tadult\t2014\n\
                       Davis2013\tFGF-21\tNA\tNA\tNA\tNA\t0.684\t0.843\t76\t83\tpediatric\t2013\n";
        let file = table_file(".tsv", content);
        let rows = load_study_table(file.path()).unwrap();
        assert_eq!(rows.len(), 2);

        let first = rows[0].as_ref().unwrap();
        assert_eq!(first.study_id, "Koene2014");
        assert_eq!(first.true_pos, Some(56));
        assert_eq!(first.false_neg, Some(14));
        assert_eq!(first.sensitivity, None);
        assert_eq!(first.publication_year, Some(2014));

        let second = rows[1].as_ref().unwrap();
        assert_eq!(second.true_pos, None);
        assert_eq!(second.sensitivity, Some(0.684));
        assert_eq!(second.n_controls, Some(83));
        assert_eq!(second.age_group.as_deref(), Some("pediatric"));
    }

    #[test]
    fn csv_extension_switches_to_comma() {
        let file = table_file(".csv", "study_id,biomarker,tp,fp,fn,tn\nA,GDF-15,40,5,10,45\n");
        let rows = load_study_table(file.path()).unwrap();
        let entry = rows[0].as_ref().unwrap();
        assert_eq!(entry.biomarker, "GDF-15");
        assert_eq!(entry.true_neg, Some(45));
    }

    #[test]
    fn unparseable_row_becomes_a_rejection() {
        let content = "study_id\tbiomarker\ttp\tfp\tfn\ttn\n\
                       Good\tLactate\t40\t5\t10\t45\n\
                       Bad\tLactate\tforty\t5\t10\t45\n";
        let file = table_file(".tsv", content);
        let rows = load_study_table(file.path()).unwrap();
        assert!(rows[0].is_ok());
        let err = rows[1].as_ref().unwrap_err();
        assert_eq!(err.study_id, "Bad");
        assert_eq!(err.biomarker, "Lactate");
        assert!(matches!(err.reason, ValidationFailure::Unparseable(..)));
    }

    #[test]
    fn ragged_row_is_rejected_without_stopping_the_load() {
        let content = "study_id\tbiomarker\ttp\tfp\tfn\ttn\n\
                       A\tLactate\t40\t5\t10\t45\n\
                       B\tLactate\t40\t5\n\
                       C\tLactate\t38\t6\t12\t44\n";
        let file = table_file(".tsv", content);
        let rows = load_study_table(file.path()).unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows[0].is_ok());

        let err = rows[1].as_ref().unwrap_err();
        assert_eq!(err.study_id, "B");
        match &err.reason {
            ValidationFailure::Unparseable(detail) => assert!(detail.contains("found 4")),
            other => panic!("Expected Unparseable, got {:?}", other),
        }

        let last = rows[2].as_ref().unwrap();
        assert_eq!(last.study_id, "C");
        assert_eq!(last.true_neg, Some(44));
    }

    #[test]
    fn missing_required_column_is_a_file_error() {
        let file = table_file(".tsv", "study_id\ttp\tfp\tfn\ttn\nA\t1\t2\t3\t4\n");
        match load_study_table(file.path()) {
            Err(DataError::ColumnNotFound(column)) => assert_eq!(column, "biomarker"),
            other => panic!("Expected ColumnNotFound, got {:?}", other),
        }
    }

    #[test]
    fn header_only_file_has_no_rows() {
        let file = table_file(".tsv", "study_id\tbiomarker\n");
        assert!(matches!(load_study_table(file.path()), Err(DataError::NoRows)));
    }
}
