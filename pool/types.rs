// ========================================================================================
//
//                               THE SHARED DATA MODEL
//
// ========================================================================================
//
// These types are the currency passed between every stage of the engine. Every
// value is immutable once built: stages derive new values instead of editing
// the ones they were given.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// ========================================================================================
//                                 Contingency tables
// ========================================================================================

/// The integer 2×2 classification table of a single study.
///
/// The diseased group contributes the true positives and false negatives; the
/// control group contributes the false positives and true negatives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TwoByTwo {
    #[serde(rename = "tp")]
    pub true_pos: u64,
    #[serde(rename = "fn")]
    pub false_neg: u64,
    #[serde(rename = "fp")]
    pub false_pos: u64,
    #[serde(rename = "tn")]
    pub true_neg: u64,
}

impl TwoByTwo {
    pub fn new(true_pos: u64, false_neg: u64, false_pos: u64, true_neg: u64) -> Self {
        Self {
            true_pos,
            false_neg,
            false_pos,
            true_neg,
        }
    }

    /// Size of the diseased group, `N_d = TP + FN`.
    pub fn diseased(&self) -> u64 {
        self.true_pos + self.false_neg
    }

    /// Size of the control group, `N_c = FP + TN`.
    pub fn controls(&self) -> u64 {
        self.false_pos + self.true_neg
    }

    /// Observed sensitivity. Zero when the diseased group is empty.
    pub fn sensitivity(&self) -> f64 {
        ratio(self.true_pos, self.diseased())
    }

    /// Observed specificity. Zero when the control group is empty.
    pub fn specificity(&self) -> f64 {
        ratio(self.true_neg, self.controls())
    }

    pub fn has_zero_cell(&self) -> bool {
        self.true_pos == 0 || self.false_neg == 0 || self.false_pos == 0 || self.true_neg == 0
    }

    /// Effective sample size used by Deeks' funnel-plot test.
    pub fn effective_sample_size(&self) -> f64 {
        let nd = self.diseased() as f64;
        let nc = self.controls() as f64;
        if nd + nc == 0.0 {
            0.0
        } else {
            4.0 * nd * nc / (nd + nc)
        }
    }
}

fn ratio(num: u64, den: u64) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

/// Whether a continuity correction was added to the cells of a study.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ContinuityCorrection {
    NotNeeded,
    Applied { magnitude: f64 },
}

impl ContinuityCorrection {
    pub fn is_applied(&self) -> bool {
        matches!(self, ContinuityCorrection::Applied { .. })
    }
}

/// Real-valued cell counts, i.e. the 2×2 table after any continuity correction.
/// All logit-scale quantities are computed from these.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CellCounts {
    pub true_pos: f64,
    pub false_neg: f64,
    pub false_pos: f64,
    pub true_neg: f64,
}

impl CellCounts {
    /// Builds the working cells for a table, adding `magnitude` to all four
    /// cells only when at least one of them is zero.
    pub fn from_table(table: &TwoByTwo, magnitude: f64) -> (Self, ContinuityCorrection) {
        let raw = Self {
            true_pos: table.true_pos as f64,
            false_neg: table.false_neg as f64,
            false_pos: table.false_pos as f64,
            true_neg: table.true_neg as f64,
        };
        if table.has_zero_cell() && magnitude > 0.0 {
            let corrected = Self {
                true_pos: raw.true_pos + magnitude,
                false_neg: raw.false_neg + magnitude,
                false_pos: raw.false_pos + magnitude,
                true_neg: raw.true_neg + magnitude,
            };
            (corrected, ContinuityCorrection::Applied { magnitude })
        } else {
            (raw, ContinuityCorrection::NotNeeded)
        }
    }

    pub fn sensitivity(&self) -> f64 {
        self.true_pos / (self.true_pos + self.false_neg)
    }

    pub fn specificity(&self) -> f64 {
        self.true_neg / (self.true_neg + self.false_pos)
    }

    /// The study's outcome pair on the logit scale together with the
    /// within-study sampling variances (Woolf's formula).
    pub fn logits(&self) -> StudyLogits {
        StudyLogits {
            sens: (self.true_pos / self.false_neg).ln(),
            spec: (self.true_neg / self.false_pos).ln(),
            var_sens: 1.0 / self.true_pos + 1.0 / self.false_neg,
            var_spec: 1.0 / self.true_neg + 1.0 / self.false_pos,
        }
    }
}

/// One study on the logit scale: `(logit sens, logit spec)` and their
/// within-study variances. The within-study covariance is zero because the
/// diseased and control groups are disjoint samples.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StudyLogits {
    pub sens: f64,
    pub spec: f64,
    pub var_sens: f64,
    pub var_spec: f64,
}

impl StudyLogits {
    /// Log diagnostic odds ratio, `D = logit(TPR) - logit(FPR)`.
    pub fn log_dor(&self) -> f64 {
        self.sens + self.spec
    }

    /// Threshold proxy, `S = logit(TPR) + logit(FPR)`.
    pub fn threshold_sum(&self) -> f64 {
        self.sens - self.spec
    }

    pub fn var_log_dor(&self) -> f64 {
        self.var_sens + self.var_spec
    }
}

// ========================================================================================
//                                  Reporting forms
// ========================================================================================

/// The three shapes in which a study may report its accuracy.
#[derive(Debug, Clone, PartialEq)]
pub enum ReportedAccuracy {
    RawCounts(TwoByTwo),
    ProportionsWithN {
        sensitivity: f64,
        specificity: f64,
        n_diseased: u64,
        n_controls: u64,
    },
    ProportionsWithCi {
        sensitivity: f64,
        specificity: f64,
        sensitivity_ci: (f64, f64),
        specificity_ci: (f64, f64),
    },
}

impl ReportedAccuracy {
    pub fn form(&self) -> ReportingForm {
        match self {
            ReportedAccuracy::RawCounts(..) => ReportingForm::RawCounts,
            ReportedAccuracy::ProportionsWithN { .. } => ReportingForm::ProportionsWithN,
            ReportedAccuracy::ProportionsWithCi { .. } => ReportingForm::ProportionsWithCi,
        }
    }
}

/// Tag of [`ReportedAccuracy`], kept on every reconciled record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportingForm {
    RawCounts,
    ProportionsWithN,
    ProportionsWithCi,
}

impl fmt::Display for ReportingForm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReportingForm::RawCounts => "raw_counts",
            ReportingForm::ProportionsWithN => "proportions_with_n",
            ReportingForm::ProportionsWithCi => "proportions_with_ci",
        };
        f.write_str(name)
    }
}

// ========================================================================================
//                                     Covariates
// ========================================================================================

/// Study-level descriptors used for subgrouping and meta-regression.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Covariates {
    pub age_group: Option<String>,
    pub condition: Option<String>,
    pub assay_platform: Option<String>,
    pub publication_year: Option<i32>,
    pub quality_tier: Option<String>,
    /// Positivity cutoff as reported by the study. Descriptive only.
    pub cutoff: Option<f64>,
    /// Free-text population description. Descriptive only.
    pub population: Option<String>,
}

/// A covariate that can drive a subgroup partition or a meta-regression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Covariate {
    AgeGroup,
    Condition,
    AssayPlatform,
    PublicationYear,
    QualityTier,
}

impl Covariate {
    pub const CATEGORICAL: [Covariate; 4] = [
        Covariate::AgeGroup,
        Covariate::Condition,
        Covariate::AssayPlatform,
        Covariate::QualityTier,
    ];

    pub const ALL: [Covariate; 5] = [
        Covariate::AgeGroup,
        Covariate::Condition,
        Covariate::AssayPlatform,
        Covariate::PublicationYear,
        Covariate::QualityTier,
    ];

    pub fn is_categorical(&self) -> bool {
        !matches!(self, Covariate::PublicationYear)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Covariate::AgeGroup => "age_group",
            Covariate::Condition => "condition",
            Covariate::AssayPlatform => "assay_platform",
            Covariate::PublicationYear => "publication_year",
            Covariate::QualityTier => "quality_tier",
        }
    }
}

impl fmt::Display for Covariate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CovariateValue {
    Categorical(String),
    Continuous(f64),
}

impl fmt::Display for CovariateValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CovariateValue::Categorical(level) => f.write_str(level),
            CovariateValue::Continuous(x) => write!(f, "{x}"),
        }
    }
}

impl Covariates {
    /// The value of `covariate` for this study, or `None` when unreported.
    /// Blank categorical levels count as unreported.
    pub fn value(&self, covariate: Covariate) -> Option<CovariateValue> {
        let level = |v: &Option<String>| {
            v.as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| CovariateValue::Categorical(s.to_string()))
        };
        match covariate {
            Covariate::AgeGroup => level(&self.age_group),
            Covariate::Condition => level(&self.condition),
            Covariate::AssayPlatform => level(&self.assay_platform),
            Covariate::QualityTier => level(&self.quality_tier),
            Covariate::PublicationYear => self
                .publication_year
                .map(|y| CovariateValue::Continuous(f64::from(y))),
        }
    }
}

// ========================================================================================
//                                Records and cohorts
// ========================================================================================

/// One study's reconciled evidence for one biomarker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudyRecord {
    pub study_id: String,
    pub biomarker: String,
    pub counts: TwoByTwo,
    pub form: ReportingForm,
    pub correction: ContinuityCorrection,
    pub cells: CellCounts,
    pub covariates: Covariates,
}

impl StudyRecord {
    /// Builds a record from a complete table, deriving the working cells with
    /// a per-study continuity correction of `correction_magnitude`.
    pub fn new(
        study_id: impl Into<String>,
        biomarker: impl Into<String>,
        counts: TwoByTwo,
        form: ReportingForm,
        covariates: Covariates,
        correction_magnitude: f64,
    ) -> Self {
        let (cells, correction) = CellCounts::from_table(&counts, correction_magnitude);
        Self {
            study_id: study_id.into(),
            biomarker: biomarker.into(),
            counts,
            form,
            correction,
            cells,
            covariates,
        }
    }

    pub fn logits(&self) -> StudyLogits {
        self.cells.logits()
    }
}

/// All accepted studies of one biomarker, ordered by study identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BiomarkerCohort {
    pub biomarker: String,
    pub studies: Vec<StudyRecord>,
}

impl BiomarkerCohort {
    pub fn new(biomarker: impl Into<String>, mut studies: Vec<StudyRecord>) -> Self {
        studies.sort_by(|a, b| a.study_id.cmp(&b.study_id));
        Self {
            biomarker: biomarker.into(),
            studies,
        }
    }

    pub fn len(&self) -> usize {
        self.studies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.studies.is_empty()
    }

    pub fn logits(&self) -> Vec<StudyLogits> {
        self.studies.iter().map(StudyRecord::logits).collect()
    }

    /// A new cohort without the study at `index`.
    pub fn without(&self, index: usize) -> Self {
        let studies = self
            .studies
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != index)
            .map(|(_, s)| s.clone())
            .collect();
        Self {
            biomarker: self.biomarker.clone(),
            studies,
        }
    }

    /// Total diseased subjects and total controls across the cohort.
    pub fn totals(&self) -> (u64, u64) {
        self.studies.iter().fold((0, 0), |(d, c), s| {
            (d + s.counts.diseased(), c + s.counts.controls())
        })
    }

    /// Ensures the cohort is large enough for `stage`.
    pub fn require(&self, stage: Stage, required: usize) -> Result<(), InsufficientDataError> {
        if self.len() < required {
            Err(InsufficientDataError {
                stage,
                found: self.len(),
                required,
            })
        } else {
            Ok(())
        }
    }
}

// ========================================================================================
//                                 Shared error types
// ========================================================================================

/// The analysis stage that imposes a minimum study count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Pooling,
    MetaRegression,
    SrocFit,
    LeaveOneOut,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Pooling => "Pooling",
            Stage::MetaRegression => "Meta-regression",
            Stage::SrocFit => "SROC fitting",
            Stage::LeaveOneOut => "Leave-one-out analysis",
        };
        f.write_str(name)
    }
}

/// A stage was asked to run on fewer studies than it can support.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("{stage} requires at least {required} studies, but only {found} are available.")]
pub struct InsufficientDataError {
    pub stage: Stage,
    pub found: usize,
    pub required: usize,
}
