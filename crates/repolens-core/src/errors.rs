//! Error types for the repolens core library.

use serde::Serialize;

/// Top-level error enum for the repolens core library.
#[derive(Debug, thiserror::Error)]
pub enum RepolensError {
    #[error("Invalid report: {0}")]
    InvalidReport(String),

    #[error("Fingerprint schema mismatch: expected {expected}, got {actual}")]
    SchemaMismatch { expected: String, actual: String },

    #[error("Unknown project: {0}")]
    UnknownProject(String),

    #[error("Unknown metric: {0}")]
    UnknownMetric(String),

    #[error("Analysis already in progress for {0}")]
    AnalysisInProgress(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Stable error classification handed to front ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidReport,
    SchemaMismatch,
    UnknownProject,
    UnknownMetric,
    AnalysisInProgress,
    StorageFailure,
}

/// Structured error body: kind plus a message that never carries storage
/// internals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorPayload {
    pub kind: ErrorKind,
    pub message: String,
}

impl RepolensError {
    pub fn schema_mismatch(expected: impl ToString, actual: impl ToString) -> Self {
        RepolensError::SchemaMismatch {
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            RepolensError::InvalidReport(_) => ErrorKind::InvalidReport,
            RepolensError::SchemaMismatch { .. } => ErrorKind::SchemaMismatch,
            RepolensError::UnknownProject(_) => ErrorKind::UnknownProject,
            RepolensError::UnknownMetric(_) => ErrorKind::UnknownMetric,
            RepolensError::AnalysisInProgress(_) => ErrorKind::AnalysisInProgress,
            RepolensError::Storage(_) | RepolensError::Sqlite(_) | RepolensError::Json(_) => {
                ErrorKind::StorageFailure
            }
        }
    }

    /// Only a concurrent duplicate analysis is worth retrying as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RepolensError::AnalysisInProgress(_))
    }

    pub fn payload(&self) -> ErrorPayload {
        let message = match self.kind() {
            ErrorKind::StorageFailure => "storage operation failed".to_string(),
            _ => self.to_string(),
        };
        ErrorPayload {
            kind: self.kind(),
            message,
        }
    }
}

pub type RepolensResult<T> = Result<T, RepolensError>;
