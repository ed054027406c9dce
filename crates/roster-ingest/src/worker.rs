//! Queue worker
//!
//! Polls the notification queue, runs up to `concurrency` ingestions at a
//! time and settles each delivery according to its outcome:
//!
//! | outcome                          | queue action                      |
//! |----------------------------------|-----------------------------------|
//! | Loaded / Duplicate / Skipped     | `ack`                             |
//! | transient failure or timeout     | `retry_later` with backoff        |
//! | transient, attempts exhausted    | `dead_letter`                     |
//! | permanent failure                | `dead_letter`                     |

use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::WorkerConfig;
use crate::pipeline::{IngestionPipeline, Outcome};
use crate::queue::{Delivery, NotificationQueue, QueueError};

const RETRY_BASE_DELAY: Duration = Duration::from_secs(5);
const RETRY_MAX_DELAY: Duration = Duration::from_secs(300);
const STATS_LOG_INTERVAL: Duration = Duration::from_secs(60);

/// Result of running one delivery through the pipeline
#[derive(Debug)]
pub enum Attempt {
    Finished(Outcome),
    TimedOut,
}

/// What to do with a delivery once its attempt is over
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    RetryLater(Duration),
    DeadLetter,
}

/// Map an attempt to its queue action. `attempts` counts this delivery.
pub fn disposition(attempt: &Attempt, attempts: i32, max_attempts: i32) -> Disposition {
    match attempt {
        Attempt::Finished(outcome) if outcome.is_success() => Disposition::Ack,
        Attempt::Finished(Outcome::Failed(err)) if !err.is_transient() => Disposition::DeadLetter,
        _ if attempts >= max_attempts => Disposition::DeadLetter,
        _ => Disposition::RetryLater(retry_delay(attempts)),
    }
}

/// Exponential backoff: 5s, 10s, 20s, ... capped at five minutes
pub fn retry_delay(attempts: i32) -> Duration {
    let exponent = (attempts.max(1) - 1).min(16) as u32;
    RETRY_BASE_DELAY
        .saturating_mul(1u32 << exponent)
        .min(RETRY_MAX_DELAY)
}

/// Delivery counters
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub received: u64,
    pub loaded: u64,
    pub duplicates: u64,
    pub skipped: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub acked: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub queue_errors: u64,
}

impl WorkerStats {
    pub fn merge(&mut self, other: &WorkerStats) {
        self.received += other.received;
        self.loaded += other.loaded;
        self.duplicates += other.duplicates;
        self.skipped += other.skipped;
        self.failed += other.failed;
        self.timed_out += other.timed_out;
        self.acked += other.acked;
        self.retried += other.retried;
        self.dead_lettered += other.dead_lettered;
        self.queue_errors += other.queue_errors;
    }

    fn record_attempt(&mut self, attempt: &Attempt) {
        match attempt {
            Attempt::Finished(Outcome::Loaded { .. }) => self.loaded += 1,
            Attempt::Finished(Outcome::Duplicate { .. }) => self.duplicates += 1,
            Attempt::Finished(Outcome::Skipped(_)) => self.skipped += 1,
            Attempt::Finished(Outcome::Failed(_)) => self.failed += 1,
            Attempt::TimedOut => self.timed_out += 1,
        }
    }

    fn record_disposition(&mut self, disposition: Disposition) {
        match disposition {
            Disposition::Ack => self.acked += 1,
            Disposition::RetryLater(_) => self.retried += 1,
            Disposition::DeadLetter => self.dead_lettered += 1,
        }
    }

    fn absorb(&mut self, joined: Result<WorkerStats, JoinError>) {
        match joined {
            Ok(stats) => self.merge(&stats),
            Err(err) if err.is_cancelled() => {},
            Err(err) => {
                // The delivery reappears once its visibility timeout lapses.
                error!(error = %err, "Ingestion task panicked");
                self.failed += 1;
            },
        }
    }
}

#[derive(Clone)]
pub struct IngestWorker {
    pipeline: IngestionPipeline,
    queue: Arc<dyn NotificationQueue>,
    config: WorkerConfig,
    permits: Arc<Semaphore>,
}

impl IngestWorker {
    pub fn new(pipeline: IngestionPipeline, queue: Arc<dyn NotificationQueue>, config: WorkerConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.concurrency.max(1)));
        Self {
            pipeline,
            queue,
            config,
            permits,
        }
    }

    /// Receive one batch of up to `concurrency` deliveries and settle all of
    /// them before returning
    pub async fn poll_once(&self) -> Result<WorkerStats, QueueError> {
        let deliveries = self
            .queue
            .receive(self.config.concurrency, self.config.visibility_timeout())
            .await?;

        let mut stats = WorkerStats::default();
        for handled in join_all(deliveries.into_iter().map(|d| self.handle(d))).await {
            stats.merge(&handled);
        }

        Ok(stats)
    }

    /// Poll until `shutdown` fires, then drain in-flight ingestions for up to
    /// the shutdown timeout. Ingestions still running after that are aborted;
    /// their reservations are released and their notifications redelivered.
    pub async fn run(&self, shutdown: CancellationToken) -> WorkerStats {
        info!(
            concurrency = self.config.concurrency,
            max_attempts = self.config.max_attempts,
            ingest_timeout_secs = self.config.ingest_timeout_secs,
            "Worker started"
        );

        let mut tasks: JoinSet<WorkerStats> = JoinSet::new();
        let mut total = WorkerStats::default();
        let mut logged = total;
        let mut report = tokio::time::interval(STATS_LOG_INTERVAL);
        report.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            while let Some(joined) = tasks.try_join_next() {
                total.absorb(joined);
            }

            let available = self.permits.available_permits();
            let mut received = 0;
            if available > 0 {
                let deliveries = match self
                    .queue
                    .receive(available, self.config.visibility_timeout())
                    .await
                {
                    Ok(deliveries) => deliveries,
                    Err(err) => {
                        error!(error = %err, "Failed to receive notifications");
                        total.queue_errors += 1;
                        Vec::new()
                    },
                };
                received = deliveries.len();

                for delivery in deliveries {
                    let Ok(permit) = self.permits.clone().acquire_owned().await else {
                        break;
                    };
                    let worker = self.clone();
                    tasks.spawn(async move {
                        let _permit = permit;
                        worker.handle(delivery).await
                    });
                }
            }

            // More work may be waiting; claim it while permits remain
            if received > 0 && self.permits.available_permits() > 0 {
                continue;
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => total.absorb(joined),
                _ = tokio::time::sleep(self.config.poll_interval()), if received == 0 => {},
                _ = report.tick() => {
                    if total != logged {
                        log_stats("Worker progress", &total);
                        logged = total;
                    }
                },
            }
        }

        info!(in_flight = tasks.len(), "Shutdown requested, draining in-flight ingestions");

        let drain = async {
            while let Some(joined) = tasks.join_next().await {
                total.absorb(joined);
            }
        };
        if tokio::time::timeout(self.config.shutdown_timeout(), drain).await.is_err() {
            warn!(
                aborted = tasks.len(),
                "Shutdown timeout elapsed, aborting remaining ingestions"
            );
            tasks.abort_all();
            while let Some(joined) = tasks.join_next().await {
                total.absorb(joined);
            }
        }

        log_stats("Worker stopped", &total);
        total
    }

    async fn handle(&self, delivery: Delivery) -> WorkerStats {
        let mut stats = WorkerStats {
            received: 1,
            ..WorkerStats::default()
        };

        debug!(
            delivery_id = delivery.id,
            file = %delivery.file,
            attempt = delivery.attempts,
            "Processing delivery"
        );

        let attempt = match self
            .pipeline
            .ingest_within(&delivery.file, self.config.ingest_timeout())
            .await
        {
            Some(outcome) => Attempt::Finished(outcome),
            None => {
                warn!(
                    file = %delivery.file,
                    timeout_secs = self.config.ingest_timeout_secs,
                    "Ingestion timed out"
                );
                Attempt::TimedOut
            },
        };
        stats.record_attempt(&attempt);

        let action = disposition(&attempt, delivery.attempts, self.config.max_attempts);
        let reason = failure_reason(&attempt);

        let settled = match action {
            Disposition::Ack => self.queue.ack(&delivery).await,
            Disposition::RetryLater(delay) => {
                debug!(file = %delivery.file, delay_secs = delay.as_secs(), "Scheduling redelivery");
                self.queue.retry_later(&delivery, delay, &reason).await
            },
            Disposition::DeadLetter => {
                warn!(
                    file = %delivery.file,
                    attempts = delivery.attempts,
                    reason = %reason,
                    "Dead-lettering notification"
                );
                self.queue.dead_letter(&delivery, &reason).await
            },
        };

        match settled {
            Ok(()) => stats.record_disposition(action),
            Err(err) => {
                // Unsettled deliveries come back after the visibility timeout.
                error!(
                    delivery_id = delivery.id,
                    file = %delivery.file,
                    error = %err,
                    "Failed to settle delivery"
                );
                stats.queue_errors += 1;
            },
        }

        stats
    }
}

fn failure_reason(attempt: &Attempt) -> String {
    match attempt {
        Attempt::Finished(Outcome::Failed(err)) => format!("{}: {}", err.kind(), err),
        Attempt::Finished(outcome) => outcome.label().to_string(),
        Attempt::TimedOut => "timeout".to_string(),
    }
}

fn log_stats(message: &str, stats: &WorkerStats) {
    info!(
        received = stats.received,
        loaded = stats.loaded,
        duplicates = stats.duplicates,
        skipped = stats.skipped,
        failed = stats.failed,
        timed_out = stats.timed_out,
        acked = stats.acked,
        retried = stats.retried,
        dead_lettered = stats.dead_lettered,
        queue_errors = stats.queue_errors,
        "{}",
        message
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{FetchError, LoadError, SchemaError};
    use crate::pipeline::SkipReason;
    use roster_common::ContentFingerprint;

    fn failed(err: impl Into<crate::error::IngestError>) -> Attempt {
        Attempt::Finished(Outcome::Failed(err.into()))
    }

    #[test]
    fn test_successful_outcomes_are_acked() {
        let fingerprint = ContentFingerprint::compute(b"x");
        for outcome in [
            Outcome::Loaded {
                table: "Grades".into(),
                rows: 1,
                fingerprint,
            },
            Outcome::Duplicate { fingerprint },
            Outcome::Skipped(SkipReason::Unmapped {
                file_name: "payroll.csv".into(),
            }),
        ] {
            assert_eq!(disposition(&Attempt::Finished(outcome), 1, 5), Disposition::Ack);
        }
    }

    #[test]
    fn test_permanent_failures_are_dead_lettered_immediately() {
        let mismatch = failed(SchemaError::ColumnMismatch {
            expected: vec!["StudentID".into()],
            found: vec![],
        });
        assert_eq!(disposition(&mismatch, 1, 5), Disposition::DeadLetter);
        assert_eq!(
            disposition(&failed(LoadError::permanent("not null")), 1, 5),
            Disposition::DeadLetter
        );
    }

    #[test]
    fn test_transient_failures_retry_until_exhausted() {
        let fetch = failed(FetchError::NotFound("raw/grades.csv".into()));
        assert_eq!(
            disposition(&fetch, 1, 3),
            Disposition::RetryLater(Duration::from_secs(5))
        );
        assert_eq!(
            disposition(&fetch, 2, 3),
            Disposition::RetryLater(Duration::from_secs(10))
        );
        assert_eq!(disposition(&fetch, 3, 3), Disposition::DeadLetter);

        assert_eq!(
            disposition(&Attempt::TimedOut, 1, 3),
            Disposition::RetryLater(Duration::from_secs(5))
        );
        assert_eq!(disposition(&Attempt::TimedOut, 3, 3), Disposition::DeadLetter);
    }

    #[test]
    fn test_retry_delay_is_capped() {
        assert_eq!(retry_delay(0), Duration::from_secs(5));
        assert_eq!(retry_delay(4), Duration::from_secs(40));
        assert_eq!(retry_delay(7), RETRY_MAX_DELAY);
        assert_eq!(retry_delay(1000), RETRY_MAX_DELAY);
    }

    #[test]
    fn test_failure_reason() {
        let reason = failure_reason(&failed(FetchError::NotFound("raw/grades.csv".into())));
        assert_eq!(reason, "fetch: Blob not found: raw/grades.csv");
        assert_eq!(failure_reason(&Attempt::TimedOut), "timeout");
    }

    #[test]
    fn test_stats_merge() {
        let mut total = WorkerStats::default();
        total.merge(&WorkerStats {
            received: 2,
            loaded: 1,
            failed: 1,
            acked: 1,
            retried: 1,
            ..WorkerStats::default()
        });
        total.merge(&WorkerStats {
            received: 1,
            duplicates: 1,
            acked: 1,
            ..WorkerStats::default()
        });
        assert_eq!(total.received, 3);
        assert_eq!(total.acked, 2);
        assert_eq!(total.duplicates, 1);
    }
}
