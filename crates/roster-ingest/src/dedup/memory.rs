//! In-process dedup store
//!
//! Reference implementation of [`DedupStore`]. A single mutex makes
//! check-and-reserve atomic; state is lost on restart, so it only
//! coordinates workers that share one process.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use roster_common::ContentFingerprint;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use uuid::Uuid;

use super::DedupStore;
use crate::error::DedupError;
use crate::types::{FileReference, IngestionRecord, RecordStatus, Reservation};

pub struct MemoryDedupStore {
    records: Mutex<HashMap<ContentFingerprint, IngestionRecord>>,
    reservation_ttl: Duration,
}

impl MemoryDedupStore {
    pub fn new(reservation_ttl: Duration) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            reservation_ttl,
        }
    }

    /// Number of records in any state
    pub fn len(&self) -> usize {
        self.lock().map(|records| records.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<ContentFingerprint, IngestionRecord>>, DedupError> {
        self.records
            .lock()
            .map_err(|_| DedupError::Backend("dedup state lock poisoned".to_string()))
    }

    fn is_expired(&self, record: &IngestionRecord, now: DateTime<Utc>) -> bool {
        record.status == RecordStatus::Reserved
            && (now - record.reserved_at)
                .to_std()
                .map(|age| age >= self.reservation_ttl)
                .unwrap_or(false)
    }
}

#[async_trait]
impl DedupStore for MemoryDedupStore {
    async fn check_and_reserve(
        &self,
        fingerprint: &ContentFingerprint,
        file: &FileReference,
    ) -> Result<Reservation, DedupError> {
        let now = Utc::now();
        let mut records = self.lock()?;

        if let Some(existing) = records.get(fingerprint) {
            match existing.status {
                RecordStatus::Committed => return Ok(Reservation::AlreadyCommitted),
                RecordStatus::Reserved if !self.is_expired(existing, now) => {
                    return Ok(Reservation::ReservedByOther)
                },
                RecordStatus::Reserved => {
                    tracing::warn!(
                        fingerprint = %fingerprint,
                        previous_file = %existing.file_reference,
                        "Taking over expired reservation"
                    );
                },
            }
        }

        let reservation_id = Uuid::new_v4();
        records.insert(
            *fingerprint,
            IngestionRecord {
                fingerprint: *fingerprint,
                file_reference: file.clone(),
                status: RecordStatus::Reserved,
                reservation_id: Some(reservation_id),
                reserved_at: now,
                updated_at: now,
            },
        );

        Ok(Reservation::Fresh(reservation_id))
    }

    async fn commit(
        &self,
        fingerprint: &ContentFingerprint,
        file: &FileReference,
    ) -> Result<(), DedupError> {
        let now = Utc::now();
        let mut records = self.lock()?;

        let record = records.entry(*fingerprint).or_insert_with(|| IngestionRecord {
            fingerprint: *fingerprint,
            file_reference: file.clone(),
            status: RecordStatus::Committed,
            reservation_id: None,
            reserved_at: now,
            updated_at: now,
        });
        record.status = RecordStatus::Committed;
        record.reservation_id = None;
        record.updated_at = now;

        Ok(())
    }

    async fn release(
        &self,
        fingerprint: &ContentFingerprint,
        reservation_id: Uuid,
    ) -> Result<(), DedupError> {
        let mut records = self.lock()?;

        let held_by_caller = records.get(fingerprint).is_some_and(|record| {
            record.status == RecordStatus::Reserved && record.reservation_id == Some(reservation_id)
        });
        if held_by_caller {
            records.remove(fingerprint);
        }

        Ok(())
    }

    async fn lookup(
        &self,
        fingerprint: &ContentFingerprint,
    ) -> Result<Option<IngestionRecord>, DedupError> {
        Ok(self.lock()?.get(fingerprint).cloned())
    }
}
