//! Postgres-backed dedup store
//!
//! Records live in `ingestion_records`, keyed by the hex fingerprint. The
//! primary key turns check-and-reserve into a single `INSERT .. ON CONFLICT`
//! that either creates the reservation, takes over an expired one, or
//! touches nothing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use roster_common::ContentFingerprint;
use sqlx::PgPool;
use std::time::Duration;
use uuid::Uuid;

use super::DedupStore;
use crate::error::DedupError;
use crate::types::{FileReference, IngestionRecord, RecordStatus, Reservation};

/// A released row can vanish between the insert and the follow-up read
const RESERVE_ATTEMPTS: usize = 3;

type RecordRow = (String, String, String, Option<Uuid>, DateTime<Utc>, DateTime<Utc>);

#[derive(Clone)]
pub struct PgDedupStore {
    pool: PgPool,
    reservation_ttl: Duration,
}

impl PgDedupStore {
    pub fn new(pool: PgPool, reservation_ttl: Duration) -> Self {
        Self {
            pool,
            reservation_ttl,
        }
    }

    async fn try_reserve(
        &self,
        fingerprint: &ContentFingerprint,
        file: &FileReference,
    ) -> Result<Option<Uuid>, DedupError> {
        let reservation_id = Uuid::new_v4();

        let reserved: Option<Uuid> = sqlx::query_scalar(
            r#"
            INSERT INTO ingestion_records
                (fingerprint, file_reference, status, reservation_id, reserved_at, updated_at)
            VALUES ($1, $2, 'reserved', $3, NOW(), NOW())
            ON CONFLICT (fingerprint) DO UPDATE
            SET file_reference = EXCLUDED.file_reference,
                reservation_id = EXCLUDED.reservation_id,
                reserved_at = NOW(),
                updated_at = NOW()
            WHERE ingestion_records.status = 'reserved'
              AND ingestion_records.reserved_at < NOW() - make_interval(secs => $4)
            RETURNING reservation_id
            "#,
        )
        .bind(fingerprint.to_hex())
        .bind(file.as_str())
        .bind(reservation_id)
        .bind(self.reservation_ttl.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;

        Ok(reserved)
    }

    async fn current_status(
        &self,
        fingerprint: &ContentFingerprint,
    ) -> Result<Option<RecordStatus>, DedupError> {
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM ingestion_records WHERE fingerprint = $1")
                .bind(fingerprint.to_hex())
                .fetch_optional(&self.pool)
                .await?;

        status.map(|s| parse_status(&s)).transpose()
    }
}

#[async_trait]
impl DedupStore for PgDedupStore {
    async fn check_and_reserve(
        &self,
        fingerprint: &ContentFingerprint,
        file: &FileReference,
    ) -> Result<Reservation, DedupError> {
        for attempt in 1..=RESERVE_ATTEMPTS {
            if let Some(reservation_id) = self.try_reserve(fingerprint, file).await? {
                return Ok(Reservation::Fresh(reservation_id));
            }

            match self.current_status(fingerprint).await? {
                Some(RecordStatus::Committed) => return Ok(Reservation::AlreadyCommitted),
                Some(RecordStatus::Reserved) => return Ok(Reservation::ReservedByOther),
                None => {
                    tracing::debug!(
                        fingerprint = %fingerprint,
                        attempt = attempt,
                        "Reservation released concurrently, retrying"
                    );
                },
            }
        }

        Err(DedupError::Backend(format!(
            "could not settle reservation for {} after {} attempts",
            fingerprint, RESERVE_ATTEMPTS
        )))
    }

    async fn commit(
        &self,
        fingerprint: &ContentFingerprint,
        file: &FileReference,
    ) -> Result<(), DedupError> {
        sqlx::query(
            r#"
            INSERT INTO ingestion_records
                (fingerprint, file_reference, status, reservation_id, reserved_at, updated_at)
            VALUES ($1, $2, 'committed', NULL, NOW(), NOW())
            ON CONFLICT (fingerprint) DO UPDATE
            SET status = 'committed',
                reservation_id = NULL,
                updated_at = NOW()
            "#,
        )
        .bind(fingerprint.to_hex())
        .bind(file.as_str())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn release(
        &self,
        fingerprint: &ContentFingerprint,
        reservation_id: Uuid,
    ) -> Result<(), DedupError> {
        let result = sqlx::query(
            r#"
            DELETE FROM ingestion_records
            WHERE fingerprint = $1 AND status = 'reserved' AND reservation_id = $2
            "#,
        )
        .bind(fingerprint.to_hex())
        .bind(reservation_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            tracing::debug!(
                fingerprint = %fingerprint,
                reservation_id = %reservation_id,
                "Reservation no longer held, nothing to release"
            );
        }

        Ok(())
    }

    async fn lookup(
        &self,
        fingerprint: &ContentFingerprint,
    ) -> Result<Option<IngestionRecord>, DedupError> {
        let row: Option<RecordRow> = sqlx::query_as(
            r#"
            SELECT fingerprint, file_reference, status, reservation_id, reserved_at, updated_at
            FROM ingestion_records
            WHERE fingerprint = $1
            "#,
        )
        .bind(fingerprint.to_hex())
        .fetch_optional(&self.pool)
        .await?;

        row.map(into_record).transpose()
    }
}

fn parse_status(value: &str) -> Result<RecordStatus, DedupError> {
    RecordStatus::parse(value)
        .ok_or_else(|| DedupError::Backend(format!("unknown record status '{}'", value)))
}

fn into_record(row: RecordRow) -> Result<IngestionRecord, DedupError> {
    let (fingerprint, file_reference, status, reservation_id, reserved_at, updated_at) = row;

    Ok(IngestionRecord {
        fingerprint: ContentFingerprint::from_hex(&fingerprint)
            .map_err(|e| DedupError::Backend(e.to_string()))?,
        file_reference: FileReference::new(file_reference),
        status: parse_status(&status)?,
        reservation_id,
        reserved_at,
        updated_at,
    })
}
