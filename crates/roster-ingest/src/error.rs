//! Error taxonomy for the ingestion pipeline
//!
//! Each pipeline step fails with its own error type. [`IngestError`] tags
//! them so the orchestrator can route every failure to a specific recovery
//! action, and so the worker knows whether redelivery can help.

use roster_common::ContentFingerprint;
use serde::Serialize;
use thiserror::Error;

/// Whether retrying the same delivery can succeed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Retry via redelivery (outage, conflict, timeout)
    Transient,
    /// Content or contract defect; retrying unchanged input fails again
    Permanent,
}

impl ErrorClass {
    pub fn as_str(&self) -> &str {
        match self {
            ErrorClass::Transient => "transient",
            ErrorClass::Permanent => "permanent",
        }
    }
}

/// Blob retrieval failed. Always transient.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Blob not found: {0}")]
    NotFound(String),

    #[error("Failed to fetch {path}: {message}")]
    Unavailable { path: String, message: String },
}

impl FetchError {
    pub fn unavailable(path: impl Into<String>, message: impl ToString) -> Self {
        FetchError::Unavailable {
            path: path.into(),
            message: message.to_string(),
        }
    }
}

/// File content does not satisfy its contract. Always permanent.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchemaError {
    #[error("Column mismatch: expected {expected:?}, found {found:?}")]
    ColumnMismatch {
        expected: Vec<String>,
        found: Vec<String>,
    },

    #[error("Malformed row at line {line}: {reason}")]
    MalformedRow { line: u64, reason: String },
}

/// Batch insert failed; the writer decides the class
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Load failed ({}): {message}", .class.as_str())]
pub struct LoadError {
    class: ErrorClass,
    message: String,
}

impl LoadError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Permanent,
            message: message.into(),
        }
    }

    pub fn class(&self) -> ErrorClass {
        self.class
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Dedup store could not be read or updated
#[derive(Error, Debug)]
pub enum DedupError {
    #[error("Dedup database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Dedup store error: {0}")]
    Backend(String),
}

/// Failure of one `ingest` call
#[derive(Error, Debug)]
pub enum IngestError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error("Fingerprint {0} is reserved by another in-flight ingestion")]
    ReservedByOther(ContentFingerprint),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Dedup(#[from] DedupError),

    /// Rows are committed but the fingerprint could not be marked committed.
    /// Redelivery could load the rows a second time, so this is never retried.
    #[error("Rows committed but fingerprint {fingerprint} was not recorded: {source}")]
    CommitUnrecorded {
        fingerprint: ContentFingerprint,
        source: DedupError,
    },
}

impl IngestError {
    pub fn class(&self) -> ErrorClass {
        match self {
            IngestError::Fetch(_) => ErrorClass::Transient,
            IngestError::Schema(_) => ErrorClass::Permanent,
            IngestError::ReservedByOther(_) => ErrorClass::Transient,
            IngestError::Load(e) => e.class(),
            IngestError::Dedup(_) => ErrorClass::Transient,
            IngestError::CommitUnrecorded { .. } => ErrorClass::Permanent,
        }
    }

    /// Stable label for logs and reports
    pub fn kind(&self) -> &'static str {
        match self {
            IngestError::Fetch(_) => "fetch",
            IngestError::Schema(SchemaError::ColumnMismatch { .. }) => "column_mismatch",
            IngestError::Schema(SchemaError::MalformedRow { .. }) => "malformed_row",
            IngestError::ReservedByOther(_) => "reserved_by_other",
            IngestError::Load(_) => "load",
            IngestError::Dedup(_) => "dedup",
            IngestError::CommitUnrecorded { .. } => "commit_unrecorded",
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let fetch = IngestError::from(FetchError::NotFound("raw/grades.csv".into()));
        assert_eq!(fetch.class(), ErrorClass::Transient);
        assert_eq!(fetch.kind(), "fetch");

        let mismatch = IngestError::from(SchemaError::ColumnMismatch {
            expected: vec!["StudentID".into()],
            found: vec![],
        });
        assert_eq!(mismatch.class(), ErrorClass::Permanent);
        assert_eq!(mismatch.kind(), "column_mismatch");

        let conflict = IngestError::ReservedByOther(ContentFingerprint::compute(b"x"));
        assert!(conflict.is_transient());
    }

    #[test]
    fn test_load_error_keeps_writer_class() {
        assert_eq!(
            IngestError::from(LoadError::permanent("bad column")).class(),
            ErrorClass::Permanent
        );
        assert_eq!(
            IngestError::from(LoadError::transient("connection reset")).class(),
            ErrorClass::Transient
        );
    }

    #[test]
    fn test_unrecorded_commit_is_not_retried() {
        let err = IngestError::CommitUnrecorded {
            fingerprint: ContentFingerprint::compute(b"x"),
            source: DedupError::Backend("connection refused".into()),
        };
        assert_eq!(err.class(), ErrorClass::Permanent);
        assert_eq!(err.kind(), "commit_unrecorded");
    }

    #[test]
    fn test_malformed_row_message_names_line() {
        let err = SchemaError::MalformedRow {
            line: 4,
            reason: "expected 3 fields, found 2".into(),
        };
        assert_eq!(err.to_string(), "Malformed row at line 4: expected 3 fields, found 2");
    }
}
