//! Error types for the mcPHASES feature pipeline

use thiserror::Error;

/// Errors that abort a pipeline run.
///
/// Apart from transient [`PipelineError::WriteFailure`]s, every variant signals
/// a data or code defect and is never retried.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Schema error in {source_name}: {message}")]
    Schema { source_name: String, message: String },

    #[error("Duplicate key ({subject_id}, day {day_in_study}) in {stage}")]
    DuplicateKey {
        stage: String,
        subject_id: String,
        day_in_study: i64,
    },

    #[error("Unknown feature '{0}': not a column of the master table")]
    UnknownFeature(String),

    #[error("Leakage invariant violated: {0}")]
    LeakageInvariant(String),

    #[error("Write failure for '{artifact}': {message}")]
    WriteFailure {
        artifact: String,
        message: String,
        transient: bool,
    },

    #[error("Missing key in {source_name} row {row}: empty {column}")]
    MissingKey {
        source_name: String,
        row: usize,
        column: String,
    },

    #[error("Cannot parse {source_name} row {row} column '{column}': {value:?}")]
    Parse {
        source_name: String,
        row: usize,
        column: String,
        value: String,
    },

    #[error("Feature columns do not match model '{model}': expected {expected:?}, got {actual:?}")]
    ColumnMismatch {
        model: String,
        expected: Vec<String>,
        actual: Vec<String>,
    },

    #[error("Cannot evaluate model: {0}")]
    Evaluation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl PipelineError {
    pub(crate) fn schema(source_name: impl Into<String>, message: impl Into<String>) -> Self {
        PipelineError::Schema {
            source_name: source_name.into(),
            message: message.into(),
        }
    }

    /// Whether a retry against the artifact store may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, PipelineError::WriteFailure { transient: true, .. })
    }
}
