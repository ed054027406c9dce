//! Content-fingerprint dedup ledger
//!
//! The only cross-invocation coordination point of the pipeline. A
//! fingerprint moves `absent -> Reserved -> Committed`, or back to absent
//! when an attempt fails. `check_and_reserve` must be an atomic
//! test-and-set against concurrent callers.
//!
//! Reservations expire: a `Reserved` record older than the store's TTL is
//! treated as absent, so an attempt that died without releasing cannot block
//! future deliveries forever.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use roster_common::ContentFingerprint;
use uuid::Uuid;

use crate::error::DedupError;
use crate::types::{FileReference, IngestionRecord, Reservation};

pub use memory::MemoryDedupStore;
pub use postgres::PgDedupStore;

/// Persistent set of ingested content fingerprints
#[async_trait]
pub trait DedupStore: Send + Sync {
    /// Atomically claim `fingerprint` for this attempt.
    ///
    /// Returns [`Reservation::Fresh`] with the reservation id when the
    /// fingerprint was absent or its reservation had expired.
    async fn check_and_reserve(
        &self,
        fingerprint: &ContentFingerprint,
        file: &FileReference,
    ) -> Result<Reservation, DedupError>;

    /// Mark the fingerprint committed. Idempotent; a missing record is
    /// recreated as committed.
    async fn commit(
        &self,
        fingerprint: &ContentFingerprint,
        file: &FileReference,
    ) -> Result<(), DedupError>;

    /// Drop the reservation identified by `reservation_id`.
    ///
    /// No-op when the record is committed or held by a different reservation.
    async fn release(
        &self,
        fingerprint: &ContentFingerprint,
        reservation_id: Uuid,
    ) -> Result<(), DedupError>;

    async fn lookup(
        &self,
        fingerprint: &ContentFingerprint,
    ) -> Result<Option<IngestionRecord>, DedupError>;
}
