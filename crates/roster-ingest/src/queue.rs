//! Delivery notifications
//!
//! The transport is at-least-once: a received notification becomes invisible
//! for a visibility timeout and reappears unless it is acknowledged, so the
//! same blob path may be delivered more than once.

use async_trait::async_trait;
use sqlx::PgPool;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

use crate::types::FileReference;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Queue database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Queue error: {0}")]
    Backend(String),
}

/// One received notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub id: i64,
    pub file: FileReference,
    /// Deliveries so far, including this one
    pub attempts: i32,
}

#[async_trait]
pub trait NotificationQueue: Send + Sync {
    /// Claim up to `max` visible notifications, hiding them for `visibility`
    async fn receive(&self, max: usize, visibility: Duration) -> Result<Vec<Delivery>, QueueError>;

    /// Remove a settled notification
    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Make the notification visible again after `delay`
    async fn retry_later(
        &self,
        delivery: &Delivery,
        delay: Duration,
        reason: &str,
    ) -> Result<(), QueueError>;

    /// Park the notification; it is never delivered again
    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), QueueError>;
}

// ============================================================================
// Postgres
// ============================================================================

/// Queue over the `ingest_notifications` table
#[derive(Clone)]
pub struct PgNotificationQueue {
    pool: PgPool,
}

impl PgNotificationQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Enqueue a notification, returning its id
    pub async fn publish(&self, file: &FileReference) -> Result<i64, QueueError> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO ingest_notifications (blob_path) VALUES ($1) RETURNING id",
        )
        .bind(file.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    /// Notifications waiting for delivery, visible or not
    pub async fn pending_count(&self) -> Result<i64, QueueError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM ingest_notifications WHERE status = 'pending'")
                .fetch_one(&self.pool)
                .await?;

        Ok(count)
    }
}

#[async_trait]
impl NotificationQueue for PgNotificationQueue {
    async fn receive(&self, max: usize, visibility: Duration) -> Result<Vec<Delivery>, QueueError> {
        if max == 0 {
            return Ok(Vec::new());
        }

        let rows: Vec<(i64, String, i32)> = sqlx::query_as(
            r#"
            WITH claimed AS (
                SELECT id
                FROM ingest_notifications
                WHERE status = 'pending' AND visible_at <= NOW()
                ORDER BY visible_at, id
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE ingest_notifications n
            SET attempts = n.attempts + 1,
                visible_at = NOW() + make_interval(secs => $2),
                updated_at = NOW()
            FROM claimed
            WHERE n.id = claimed.id
            RETURNING n.id, n.blob_path, n.attempts
            "#,
        )
        .bind(max as i64)
        .bind(visibility.as_secs_f64())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, blob_path, attempts)| Delivery {
                id,
                file: FileReference::new(blob_path),
                attempts,
            })
            .collect())
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        sqlx::query("DELETE FROM ingest_notifications WHERE id = $1")
            .bind(delivery.id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn retry_later(
        &self,
        delivery: &Delivery,
        delay: Duration,
        reason: &str,
    ) -> Result<(), QueueError> {
        sqlx::query(
            r#"
            UPDATE ingest_notifications
            SET visible_at = NOW() + make_interval(secs => $2),
                last_error = $3,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(delivery.id)
        .bind(delay.as_secs_f64())
        .bind(reason)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), QueueError> {
        sqlx::query(
            r#"
            UPDATE ingest_notifications
            SET status = 'dead', last_error = $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(delivery.id)
        .bind(reason)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

// ============================================================================
// In-memory
// ============================================================================

#[derive(Debug)]
struct Entry {
    file: FileReference,
    attempts: i32,
    visible_at: Instant,
}

/// Settled notifications kept for inspection, per kind
pub const SETTLED_HISTORY: usize = 1024;

#[derive(Debug, Default)]
struct MemoryState {
    next_id: i64,
    pending: BTreeMap<i64, Entry>,
    acked: VecDeque<FileReference>,
    dead: VecDeque<(FileReference, String)>,
}

fn push_bounded<T>(history: &mut VecDeque<T>, item: T) {
    if history.len() == SETTLED_HISTORY {
        history.pop_front();
    }
    history.push_back(item);
}

/// Single-process queue with the same visibility semantics, for tests and
/// local runs. Only the most recent [`SETTLED_HISTORY`] acks and dead letters
/// are remembered.
#[derive(Debug, Default)]
pub struct MemoryNotificationQueue {
    state: Mutex<MemoryState>,
}

impl MemoryNotificationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, file: impl Into<FileReference>) -> i64 {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.next_id += 1;
        let id = state.next_id;
        state.pending.insert(
            id,
            Entry {
                file: file.into(),
                attempts: 0,
                visible_at: Instant::now(),
            },
        );
        id
    }

    pub fn pending_len(&self) -> usize {
        self.state.lock().map(|s| s.pending.len()).unwrap_or_default()
    }

    /// Most recent acknowledged blob paths, in ack order
    pub fn acked(&self) -> Vec<FileReference> {
        self.state
            .lock()
            .map(|s| s.acked.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Most recent dead-lettered blob paths with their reasons
    pub fn dead_lettered(&self) -> Vec<(FileReference, String)> {
        self.state
            .lock()
            .map(|s| s.dead.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Delivery count of a pending notification
    pub fn attempts(&self, id: i64) -> Option<i32> {
        self.state
            .lock()
            .ok()
            .and_then(|s| s.pending.get(&id).map(|e| e.attempts))
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryState>, QueueError> {
        self.state
            .lock()
            .map_err(|_| QueueError::Backend("queue state lock poisoned".to_string()))
    }
}

#[async_trait]
impl NotificationQueue for MemoryNotificationQueue {
    async fn receive(&self, max: usize, visibility: Duration) -> Result<Vec<Delivery>, QueueError> {
        let now = Instant::now();
        let mut state = self.lock()?;

        let mut deliveries = Vec::new();
        for (id, entry) in state.pending.iter_mut() {
            if deliveries.len() >= max {
                break;
            }
            if entry.visible_at > now {
                continue;
            }
            entry.attempts += 1;
            entry.visible_at = now + visibility;
            deliveries.push(Delivery {
                id: *id,
                file: entry.file.clone(),
                attempts: entry.attempts,
            });
        }

        Ok(deliveries)
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut state = self.lock()?;
        if let Some(entry) = state.pending.remove(&delivery.id) {
            push_bounded(&mut state.acked, entry.file);
        }
        Ok(())
    }

    async fn retry_later(
        &self,
        delivery: &Delivery,
        delay: Duration,
        _reason: &str,
    ) -> Result<(), QueueError> {
        let mut state = self.lock()?;
        if let Some(entry) = state.pending.get_mut(&delivery.id) {
            entry.visible_at = Instant::now() + delay;
        }
        Ok(())
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), QueueError> {
        let mut state = self.lock()?;
        if let Some(entry) = state.pending.remove(&delivery.id) {
            push_bounded(&mut state.dead, (entry.file, reason.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_receive_hides_until_visibility_expires() {
        let queue = MemoryNotificationQueue::new();
        queue.publish("raw/grades.csv");

        let first = queue.receive(10, Duration::from_millis(30)).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].attempts, 1);
        assert!(queue.receive(10, Duration::from_millis(30)).await.unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(50)).await;

        let again = queue.receive(10, Duration::from_secs(30)).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].id, first[0].id);
        assert_eq!(again[0].attempts, 2);
    }

    #[tokio::test]
    async fn test_receive_respects_max() {
        let queue = MemoryNotificationQueue::new();
        for name in ["a.csv", "b.csv", "c.csv"] {
            queue.publish(name);
        }

        let batch = queue.receive(2, Duration::from_secs(30)).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].file.as_str(), "a.csv");
        assert!(queue.receive(0, Duration::from_secs(30)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ack_and_dead_letter() {
        let queue = MemoryNotificationQueue::new();
        queue.publish("raw/grades.csv");
        queue.publish("raw/attendance.csv");

        let deliveries = queue.receive(10, Duration::from_secs(30)).await.unwrap();
        queue.ack(&deliveries[0]).await.unwrap();
        queue.dead_letter(&deliveries[1], "column_mismatch").await.unwrap();

        assert_eq!(queue.pending_len(), 0);
        assert_eq!(queue.acked(), vec![FileReference::new("raw/grades.csv")]);
        assert_eq!(queue.dead_lettered()[0].1, "column_mismatch");
    }

    #[tokio::test]
    async fn test_settled_history_is_bounded() {
        let queue = MemoryNotificationQueue::new();
        for i in 0..SETTLED_HISTORY + 5 {
            queue.publish(format!("raw/{i}.csv"));
        }

        let deliveries = queue.receive(usize::MAX, Duration::from_secs(30)).await.unwrap();
        for delivery in &deliveries {
            queue.ack(delivery).await.unwrap();
        }

        let acked = queue.acked();
        assert_eq!(acked.len(), SETTLED_HISTORY);
        assert_eq!(acked[0].as_str(), "raw/5.csv");
        assert_eq!(queue.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_retry_later_delays_redelivery() {
        let queue = MemoryNotificationQueue::new();
        let id = queue.publish("raw/grades.csv");

        let delivery = queue.receive(1, Duration::from_secs(30)).await.unwrap().remove(0);
        queue.retry_later(&delivery, Duration::ZERO, "fetch").await.unwrap();

        let again = queue.receive(1, Duration::from_secs(30)).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(queue.attempts(id), Some(2));
    }
}
