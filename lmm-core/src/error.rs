//! Error taxonomy of the likelihood engine.

use lmm_linalg::LinalgError;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LmmError {
    /// Zero or more than one of {h2, log_delta, delta} supplied, or a value
    /// outside its domain.
    #[error("Invalid ridge parameterization: {0}")]
    InvalidParameterization(String),

    #[error("Dimension mismatch in {context}: expected {expected}, got {got}")]
    DimensionMismatch {
        context: String,
        expected: usize,
        got: usize,
    },

    /// Zero ridge combined with a rank-deficient decomposition.
    #[error("Singular model: {0}")]
    SingularModel(String),

    /// The negative log-likelihood is not real-valued, usually because of a
    /// zero-variance covariate.
    #[error("Degenerate model in {context}: {detail}")]
    DegenerateModel { context: String, detail: String },

    /// Quadratic forms computed under different ridge values were combined.
    #[error("Inconsistent spectrum: {0}")]
    InconsistentSpectrum(String),

    #[error("Label mismatch in {context}")]
    LabelMismatch { context: String },

    #[error("Block already set in {context}")]
    BlockAlreadySet { context: String },

    /// A quadratic form still holds unset entries where a complete one is needed.
    #[error("Unset block in {context}")]
    UnsetBlock { context: String },

    #[error("Missing value in {context} at row {row}")]
    MissingValue { context: String, row: usize },

    #[error("Phenotype row {row} is partially missing")]
    PartialMissingPhenotype { row: usize },

    #[error(transparent)]
    Linalg(#[from] LinalgError),
}

impl LmmError {
    /// Local errors are recorded against one marker or phenotype and the run
    /// continues; everything else aborts the enclosing unit of work.
    pub fn is_local(&self) -> bool {
        matches!(self, LmmError::DegenerateModel { .. })
    }

    pub(crate) fn dims(context: impl Into<String>, expected: usize, got: usize) -> Self {
        LmmError::DimensionMismatch {
            context: context.into(),
            expected,
            got,
        }
    }

    pub(crate) fn degenerate(context: impl Into<String>, detail: impl Into<String>) -> Self {
        LmmError::DegenerateModel {
            context: context.into(),
            detail: detail.into(),
        }
    }

    /// Prefix the context of a degenerate-model error, leaving others intact.
    pub fn in_context(self, outer: &str) -> Self {
        match self {
            LmmError::DegenerateModel { context, detail } => LmmError::DegenerateModel {
                context: format!("{}: {}", outer, context),
                detail,
            },
            other => other,
        }
    }
}

pub type LmmResult<T> = Result<T, LmmError>;
