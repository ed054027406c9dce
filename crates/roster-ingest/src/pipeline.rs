//! Ingestion pipeline
//!
//! Runs one delivery through
//! `fetch -> fingerprint -> lookup -> reserve -> validate -> load -> commit`.
//! Every failure after the reservation releases it before the outcome is
//! reported, and a dropped `ingest` future releases it from a spawned task.
//!
//! The pipeline holds no mutable state of its own; concurrent calls are
//! serialized only by [`DedupStore::check_and_reserve`].

use roster_common::ContentFingerprint;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::dedup::DedupStore;
use crate::error::{ErrorClass, IngestError};
use crate::fetcher::ContentFetcher;
use crate::registry::SchemaRegistry;
use crate::types::{FileReference, LoadBatch, Reservation};
use crate::validator;
use crate::writer::LoadWriter;

const COMMIT_ATTEMPTS: u32 = 3;
const COMMIT_BACKOFF: Duration = Duration::from_millis(200);

/// Why a delivery was ignored
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    /// No contract is registered for the file name
    Unmapped { file_name: String },
}

/// Terminal result of one `ingest` call
#[derive(Debug)]
pub enum Outcome {
    Loaded {
        table: String,
        rows: usize,
        fingerprint: ContentFingerprint,
    },
    Skipped(SkipReason),
    /// Content was already committed by an earlier delivery
    Duplicate { fingerprint: ContentFingerprint },
    Failed(IngestError),
}

impl Outcome {
    /// Loaded, Skipped and Duplicate all settle the delivery
    pub fn is_success(&self) -> bool {
        !matches!(self, Outcome::Failed(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Loaded { .. } => "loaded",
            Outcome::Skipped(_) => "skipped",
            Outcome::Duplicate { .. } => "duplicate",
            Outcome::Failed(_) => "failed",
        }
    }

    pub fn error(&self) -> Option<&IngestError> {
        match self {
            Outcome::Failed(err) => Some(err),
            _ => None,
        }
    }

    pub fn report(&self, file: &FileReference) -> OutcomeReport {
        let mut report = OutcomeReport {
            file: file.clone(),
            outcome: self.label(),
            table: None,
            rows: None,
            fingerprint: None,
            skip: None,
            error_kind: None,
            error_class: None,
            error: None,
        };

        match self {
            Outcome::Loaded {
                table,
                rows,
                fingerprint,
            } => {
                report.table = Some(table.clone());
                report.rows = Some(*rows);
                report.fingerprint = Some(*fingerprint);
            },
            Outcome::Skipped(reason) => report.skip = Some(reason.clone()),
            Outcome::Duplicate { fingerprint } => report.fingerprint = Some(*fingerprint),
            Outcome::Failed(err) => {
                report.error_kind = Some(err.kind());
                report.error_class = Some(err.class());
                report.error = Some(err.to_string());
            },
        }

        report
    }
}

/// Flat, serializable view of an [`Outcome`]
#[derive(Debug, Clone, Serialize)]
pub struct OutcomeReport {
    pub file: FileReference,
    pub outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<ContentFingerprint>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip: Option<SkipReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_class: Option<ErrorClass>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Orchestrates one ingestion per delivered notification
#[derive(Clone)]
pub struct IngestionPipeline {
    registry: Arc<SchemaRegistry>,
    fetcher: Arc<dyn ContentFetcher>,
    dedup: Arc<dyn DedupStore>,
    writer: Arc<dyn LoadWriter>,
}

impl IngestionPipeline {
    pub fn new(
        registry: Arc<SchemaRegistry>,
        fetcher: Arc<dyn ContentFetcher>,
        dedup: Arc<dyn DedupStore>,
        writer: Arc<dyn LoadWriter>,
    ) -> Self {
        Self {
            registry,
            fetcher,
            dedup,
            writer,
        }
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    /// Ingest one file. Never panics or returns early without an outcome;
    /// every outcome is logged once.
    #[instrument(skip_all, fields(file = %file))]
    pub async fn ingest(&self, file: &FileReference) -> Outcome {
        let outcome = self.run(file).await;
        log_outcome(file, &outcome);
        outcome
    }

    /// Ingest one file, giving up after `limit`.
    ///
    /// Returns `None` when the limit elapses; the dropped attempt releases
    /// its reservation. Keep `limit` below the dedup reservation TTL so a
    /// live attempt cannot be taken over.
    pub async fn ingest_within(&self, file: &FileReference, limit: Duration) -> Option<Outcome> {
        tokio::time::timeout(limit, self.ingest(file)).await.ok()
    }

    async fn run(&self, file: &FileReference) -> Outcome {
        // An empty payload or a directory path names no blob at all
        if file.file_name().is_empty() {
            return Outcome::Skipped(SkipReason::Unmapped {
                file_name: String::new(),
            });
        }

        let bytes = match self.fetcher.fetch(file).await {
            Ok(bytes) => bytes,
            Err(err) => return Outcome::Failed(err.into()),
        };

        let fingerprint = ContentFingerprint::compute(&bytes);

        let Some(contract) = self.registry.lookup(file) else {
            return Outcome::Skipped(SkipReason::Unmapped {
                file_name: file.file_name().to_string(),
            });
        };

        let guard = match self.dedup.check_and_reserve(&fingerprint, file).await {
            Ok(Reservation::Fresh(reservation_id)) => {
                ReservationGuard::new(self.dedup.clone(), fingerprint, reservation_id)
            },
            Ok(Reservation::AlreadyCommitted) => return Outcome::Duplicate { fingerprint },
            Ok(Reservation::ReservedByOther) => {
                return Outcome::Failed(IngestError::ReservedByOther(fingerprint))
            },
            Err(err) => return Outcome::Failed(err.into()),
        };

        let rows = match validator::parse(&bytes, contract) {
            Ok(rows) => rows,
            Err(err) => {
                guard.release().await;
                return Outcome::Failed(err.into());
            },
        };
        drop(bytes);

        let batch = LoadBatch {
            table: contract.table().to_string(),
            columns: contract.columns().to_vec(),
            rows,
        };

        let ack = match self.writer.insert_batch(&batch).await {
            Ok(ack) => ack,
            Err(err) => {
                guard.release().await;
                return Outcome::Failed(err.into());
            },
        };

        // From here on the rows are visible; releasing would let a redelivery
        // load them again.
        guard.disarm();

        if let Err(err) = self.commit(&fingerprint, file).await {
            return Outcome::Failed(IngestError::CommitUnrecorded {
                fingerprint,
                source: err,
            });
        }

        Outcome::Loaded {
            table: batch.table,
            rows: ack.rows_inserted,
            fingerprint,
        }
    }

    async fn commit(
        &self,
        fingerprint: &ContentFingerprint,
        file: &FileReference,
    ) -> Result<(), crate::error::DedupError> {
        let mut attempt = 1;
        loop {
            match self.dedup.commit(fingerprint, file).await {
                Ok(()) => return Ok(()),
                Err(err) if attempt < COMMIT_ATTEMPTS => {
                    warn!(
                        fingerprint = %fingerprint,
                        attempt = attempt,
                        error = %err,
                        "Failed to record commit, retrying"
                    );
                    tokio::time::sleep(COMMIT_BACKOFF * attempt).await;
                    attempt += 1;
                },
                Err(err) => return Err(err),
            }
        }
    }
}

fn log_outcome(file: &FileReference, outcome: &Outcome) {
    match outcome {
        Outcome::Loaded {
            table,
            rows,
            fingerprint,
        } => info!(
            file = %file,
            table = %table,
            rows = rows,
            fingerprint = %fingerprint,
            "File loaded"
        ),
        Outcome::Duplicate { fingerprint } => info!(
            file = %file,
            fingerprint = %fingerprint,
            "Duplicate content, already loaded"
        ),
        Outcome::Skipped(SkipReason::Unmapped { file_name }) => warn!(
            file = %file,
            file_name = %file_name,
            "No schema registered for file, skipping"
        ),
        Outcome::Failed(err) if err.is_transient() => warn!(
            file = %file,
            error_kind = err.kind(),
            error = %err,
            "Ingestion failed (transient)"
        ),
        Outcome::Failed(err) => error!(
            file = %file,
            error_kind = err.kind(),
            error = %err,
            "Ingestion failed (permanent)"
        ),
    }
}

/// Holds a fresh reservation until it is released or handed to commit.
///
/// Dropped while still armed (the `ingest` future was cancelled), it
/// releases the reservation from a task on the current runtime. If no
/// runtime is available the reservation is left to expire.
struct ReservationGuard {
    dedup: Arc<dyn DedupStore>,
    fingerprint: ContentFingerprint,
    reservation_id: Uuid,
    armed: bool,
}

impl ReservationGuard {
    fn new(dedup: Arc<dyn DedupStore>, fingerprint: ContentFingerprint, reservation_id: Uuid) -> Self {
        Self {
            dedup,
            fingerprint,
            reservation_id,
            armed: true,
        }
    }

    async fn release(mut self) {
        self.armed = false;
        release_reservation(self.dedup.as_ref(), &self.fingerprint, self.reservation_id).await;
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for ReservationGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        let dedup = self.dedup.clone();
        let fingerprint = self.fingerprint;
        let reservation_id = self.reservation_id;

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(fingerprint = %fingerprint, "Ingestion cancelled, releasing reservation");
                handle.spawn(async move {
                    release_reservation(dedup.as_ref(), &fingerprint, reservation_id).await;
                });
            },
            Err(_) => warn!(
                fingerprint = %fingerprint,
                "Ingestion cancelled outside a runtime, reservation left to expire"
            ),
        }
    }
}

async fn release_reservation(dedup: &dyn DedupStore, fingerprint: &ContentFingerprint, reservation_id: Uuid) {
    if let Err(err) = dedup.release(fingerprint, reservation_id).await {
        warn!(
            fingerprint = %fingerprint,
            error = %err,
            "Failed to release reservation, it will expire"
        );
    }
}
