//! Core types shared by the pipeline stages

use chrono::{DateTime, Utc};
use roster_common::ContentFingerprint;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Blob path named by a delivery notification, e.g. `raw/enrollment.csv`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileReference(String);

impl FileReference {
    /// Build a reference from a notification payload; surrounding whitespace
    /// (trailing newlines included) is not part of the path.
    pub fn new(path: impl Into<String>) -> Self {
        let path = path.into();
        let trimmed = path.trim();
        if trimmed.len() == path.len() {
            Self(path)
        } else {
            Self(trimmed.to_string())
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Final path segment, the key used for registry lookup
    pub fn file_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or_default()
    }
}

impl fmt::Display for FileReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FileReference {
    fn from(path: &str) -> Self {
        Self::new(path)
    }
}

impl From<String> for FileReference {
    fn from(path: String) -> Self {
        Self::new(path)
    }
}

/// One data row, values ordered like the contract's columns
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedRow(Vec<String>);

impl ParsedRow {
    pub fn new(values: Vec<String>) -> Self {
        Self(values)
    }

    pub fn values(&self) -> &[String] {
        &self.0
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.0.get(index).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// All rows of one file, inserted as a single unit
#[derive(Debug, Clone)]
pub struct LoadBatch {
    pub table: String,
    pub columns: Vec<String>,
    pub rows: Vec<ParsedRow>,
}

impl LoadBatch {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}

/// Acknowledgement of a committed batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadAck {
    pub rows_inserted: usize,
}

/// Lifecycle of a fingerprint in the dedup store.
///
/// A released reservation is deleted rather than kept in a failed state, so
/// the next delivery of the same content starts from scratch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Reserved,
    Committed,
}

impl RecordStatus {
    pub fn as_str(&self) -> &str {
        match self {
            RecordStatus::Reserved => "reserved",
            RecordStatus::Committed => "committed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "reserved" => Some(RecordStatus::Reserved),
            "committed" => Some(RecordStatus::Committed),
            _ => None,
        }
    }
}

/// Dedup ledger entry for one fingerprint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestionRecord {
    pub fingerprint: ContentFingerprint,
    pub file_reference: FileReference,
    pub status: RecordStatus,
    /// Identifies the attempt holding a reservation; cleared on commit
    pub reservation_id: Option<Uuid>,
    pub reserved_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Result of an atomic check-and-reserve
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    /// First sighting (or an expired reservation was taken over)
    Fresh(Uuid),
    AlreadyCommitted,
    ReservedByOther,
}
