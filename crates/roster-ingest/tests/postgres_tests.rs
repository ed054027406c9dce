//! PostgreSQL-backed dedup ledger, load writer and notification queue
//!
//! These tests start a PostgreSQL container and are ignored by default.
//! Run with: cargo test -p roster-ingest --test postgres_tests -- --ignored

mod common;

use anyhow::Result;
use common::{ENROLLMENT_NAME_FIRST_CSV, GRADES_CSV};
use roster_common::ContentFingerprint;
use roster_ingest::dedup::{DedupStore, PgDedupStore};
use roster_ingest::error::ErrorClass;
use roster_ingest::fetcher::MemoryFetcher;
use roster_ingest::queue::{NotificationQueue, PgNotificationQueue};
use roster_ingest::registry::SchemaRegistry;
use roster_ingest::types::{FileReference, LoadBatch, ParsedRow, RecordStatus, Reservation};
use roster_ingest::writer::{LoadWriter, PgLoadWriter};
use roster_ingest::{IngestionPipeline, Outcome};
use serial_test::serial;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use testcontainers::{runners::AsyncRunner, ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;

async fn start_postgres() -> Result<(ContainerAsync<Postgres>, PgPool)> {
    common::init_tracing();

    let container = Postgres::default().with_tag("16-alpine").start().await?;
    let host = container.get_host().await?;
    let port = container.get_host_port_ipv4(5432).await?;
    let url = format!("postgresql://postgres:postgres@{}:{}/postgres", host, port);

    let pool = PgPoolOptions::new().max_connections(10).connect(&url).await?;
    sqlx::migrate!("../../migrations").run(&pool).await?;

    Ok((container, pool))
}

fn fingerprint(content: &str) -> ContentFingerprint {
    ContentFingerprint::compute(content.as_bytes())
}

fn row(values: &[&str]) -> ParsedRow {
    ParsedRow::new(values.iter().map(|v| v.to_string()).collect())
}

fn grades_batch(rows: Vec<ParsedRow>) -> LoadBatch {
    LoadBatch {
        table: "Grades".into(),
        columns: vec!["StudentID".into(), "Course".into(), "Grade".into()],
        rows,
    }
}

async fn count(pool: &PgPool, table: &str) -> Result<i64> {
    let sql = format!("SELECT COUNT(*) FROM \"{}\"", table);
    Ok(sqlx::query_scalar(&sql).fetch_one(pool).await?)
}

// ============================================================================
// Dedup ledger
// ============================================================================

#[tokio::test]
#[ignore] // Requires Docker
#[serial]
async fn test_dedup_reserve_commit_release() -> Result<()> {
    let (_container, pool) = start_postgres().await?;
    let store = PgDedupStore::new(pool.clone(), Duration::from_secs(600));
    let file = FileReference::new("raw/grades.csv");
    let fp = fingerprint(GRADES_CSV);

    let Reservation::Fresh(reservation_id) = store.check_and_reserve(&fp, &file).await? else {
        panic!("expected a fresh reservation");
    };
    assert_eq!(
        store.check_and_reserve(&fp, &file).await?,
        Reservation::ReservedByOther
    );

    let record = store.lookup(&fp).await?.expect("reserved record");
    assert_eq!(record.status, RecordStatus::Reserved);
    assert_eq!(record.reservation_id, Some(reservation_id));

    // Release with a stale token is ignored.
    store.release(&fp, uuid::Uuid::new_v4()).await?;
    assert!(store.lookup(&fp).await?.is_some());

    store.release(&fp, reservation_id).await?;
    assert!(store.lookup(&fp).await?.is_none());

    let Reservation::Fresh(reservation_id) = store.check_and_reserve(&fp, &file).await? else {
        panic!("expected a fresh reservation after release");
    };
    store.commit(&fp, &file).await?;
    assert_eq!(
        store.check_and_reserve(&fp, &file).await?,
        Reservation::AlreadyCommitted
    );

    // Committed records survive a late release.
    store.release(&fp, reservation_id).await?;
    let record = store.lookup(&fp).await?.expect("committed record");
    assert_eq!(record.status, RecordStatus::Committed);
    assert_eq!(record.reservation_id, None);
    assert_eq!(record.fingerprint, fp);

    Ok(())
}

#[tokio::test]
#[ignore] // Requires Docker
#[serial]
async fn test_dedup_single_winner_under_contention() -> Result<()> {
    let (_container, pool) = start_postgres().await?;
    let store = Arc::new(PgDedupStore::new(pool, Duration::from_secs(600)));
    let fp = fingerprint(GRADES_CSV);

    let handles: Vec<_> = (0..16)
        .map(|i| {
            let store = store.clone();
            let file = FileReference::new(format!("raw/{i}/grades.csv"));
            tokio::spawn(async move { store.check_and_reserve(&fp, &file).await })
        })
        .collect();

    let mut fresh = 0;
    for handle in handles {
        match handle.await?? {
            Reservation::Fresh(_) => fresh += 1,
            Reservation::ReservedByOther => {},
            Reservation::AlreadyCommitted => panic!("nothing was committed"),
        }
    }
    assert_eq!(fresh, 1);

    Ok(())
}

#[tokio::test]
#[ignore] // Requires Docker
#[serial]
async fn test_dedup_expired_reservation_is_taken_over() -> Result<()> {
    let (_container, pool) = start_postgres().await?;
    let store = PgDedupStore::new(pool, Duration::from_secs(1));
    let file = FileReference::new("raw/grades.csv");
    let fp = fingerprint(GRADES_CSV);

    let Reservation::Fresh(first) = store.check_and_reserve(&fp, &file).await? else {
        panic!("expected a fresh reservation");
    };

    tokio::time::sleep(Duration::from_millis(1500)).await;

    let Reservation::Fresh(second) = store.check_and_reserve(&fp, &file).await? else {
        panic!("expired reservation was not taken over");
    };
    assert_ne!(first, second);

    // The previous holder can no longer drop the new reservation.
    store.release(&fp, first).await?;
    assert_eq!(
        store.lookup(&fp).await?.and_then(|r| r.reservation_id),
        Some(second)
    );

    Ok(())
}

// ============================================================================
// Load writer
// ============================================================================

#[tokio::test]
#[ignore] // Requires Docker
#[serial]
async fn test_writer_inserts_batch_with_nulls() -> Result<()> {
    let (_container, pool) = start_postgres().await?;
    let writer = PgLoadWriter::new(pool.clone());

    let ack = writer
        .insert_batch(&grades_batch(vec![
            row(&["1001", "CS101", "A"]),
            row(&["1002", "CS101", ""]),
        ]))
        .await?;

    assert_eq!(ack.rows_inserted, 2);
    assert_eq!(count(&pool, "Grades").await?, 2);

    let missing: Option<String> =
        sqlx::query_scalar(r#"SELECT "Grade" FROM "Grades" WHERE "StudentID" = '1002'"#)
            .fetch_one(&pool)
            .await?;
    assert_eq!(missing, None);

    Ok(())
}

#[tokio::test]
#[ignore] // Requires Docker
#[serial]
async fn test_writer_rolls_back_whole_batch() -> Result<()> {
    let (_container, pool) = start_postgres().await?;
    sqlx::query(r#"CREATE TABLE "Strict" ("A" TEXT NOT NULL)"#)
        .execute(&pool)
        .await?;
    let writer = PgLoadWriter::new(pool.clone());

    let err = writer
        .insert_batch(&LoadBatch {
            table: "Strict".into(),
            columns: vec!["A".into()],
            rows: vec![row(&["ok"]), row(&[""]), row(&["ok"])],
        })
        .await
        .expect_err("NOT NULL violation");

    assert_eq!(err.class(), ErrorClass::Permanent);
    assert_eq!(count(&pool, "Strict").await?, 0);

    Ok(())
}

#[tokio::test]
#[ignore] // Requires Docker
#[serial]
async fn test_writer_missing_table_is_permanent() -> Result<()> {
    let (_container, pool) = start_postgres().await?;
    let writer = PgLoadWriter::new(pool);

    let err = writer
        .insert_batch(&LoadBatch {
            table: "Payroll".into(),
            columns: vec!["EmployeeID".into()],
            rows: vec![row(&["7"])],
        })
        .await
        .expect_err("undefined table");

    assert_eq!(err.class(), ErrorClass::Permanent);

    Ok(())
}

#[tokio::test]
#[ignore] // Requires Docker
#[serial]
async fn test_writer_closed_pool_is_transient() -> Result<()> {
    let (_container, pool) = start_postgres().await?;
    let writer = PgLoadWriter::new(pool.clone());
    pool.close().await;

    let err = writer
        .insert_batch(&grades_batch(vec![row(&["1001", "CS101", "A"])]))
        .await
        .expect_err("pool closed");

    assert_eq!(err.class(), ErrorClass::Transient);

    Ok(())
}

// ============================================================================
// Notification queue
// ============================================================================

#[tokio::test]
#[ignore] // Requires Docker
#[serial]
async fn test_queue_visibility_and_settlement() -> Result<()> {
    let (_container, pool) = start_postgres().await?;
    let queue = PgNotificationQueue::new(pool.clone());

    queue.publish(&"raw/grades.csv".into()).await?;
    queue.publish(&"raw/attendance.csv".into()).await?;
    queue.publish(&"raw/enrollment.csv".into()).await?;
    assert_eq!(queue.pending_count().await?, 3);

    let claimed = queue.receive(10, Duration::from_secs(60)).await?;
    assert_eq!(claimed.len(), 3);
    assert!(claimed.iter().all(|d| d.attempts == 1));
    assert!(queue.receive(10, Duration::from_secs(60)).await?.is_empty());

    queue.ack(&claimed[0]).await?;
    queue.dead_letter(&claimed[1], "column_mismatch: bad header").await?;
    queue.retry_later(&claimed[2], Duration::ZERO, "fetch: not found").await?;
    assert_eq!(queue.pending_count().await?, 1);

    let again = queue.receive(10, Duration::from_secs(60)).await?;
    assert_eq!(again.len(), 1);
    assert_eq!(again[0].id, claimed[2].id);
    assert_eq!(again[0].attempts, 2);

    let (status, last_error): (String, Option<String>) =
        sqlx::query_as("SELECT status, last_error FROM ingest_notifications WHERE id = $1")
            .bind(claimed[1].id)
            .fetch_one(&pool)
            .await?;
    assert_eq!(status, "dead");
    assert_eq!(last_error.as_deref(), Some("column_mismatch: bad header"));

    Ok(())
}

#[tokio::test]
#[ignore] // Requires Docker
#[serial]
async fn test_queue_concurrent_receivers_get_disjoint_deliveries() -> Result<()> {
    let (_container, pool) = start_postgres().await?;
    let queue = PgNotificationQueue::new(pool);
    for i in 0..20 {
        queue.publish(&FileReference::new(format!("raw/{i}/grades.csv"))).await?;
    }

    let (a, b) = tokio::join!(
        queue.receive(15, Duration::from_secs(60)),
        queue.receive(15, Duration::from_secs(60))
    );
    let mut ids: Vec<i64> = a?.into_iter().chain(b?).map(|d| d.id).collect();
    let claimed = ids.len();
    ids.sort_unstable();
    ids.dedup();

    assert_eq!(ids.len(), claimed);
    assert_eq!(claimed, 20);

    Ok(())
}

// ============================================================================
// Pipeline
// ============================================================================

#[tokio::test]
#[ignore] // Requires Docker
#[serial]
async fn test_pipeline_loads_once_into_postgres() -> Result<()> {
    let (_container, pool) = start_postgres().await?;

    let fetcher = Arc::new(MemoryFetcher::new());
    fetcher.insert("raw/enrollment.csv", ENROLLMENT_NAME_FIRST_CSV);
    fetcher.insert("raw/grades.csv", "StudentID,Course\n1001,CS101\n");
    let dedup = Arc::new(PgDedupStore::new(pool.clone(), Duration::from_secs(600)));
    let pipeline = IngestionPipeline::new(
        Arc::new(SchemaRegistry::builtin()),
        fetcher,
        dedup.clone(),
        Arc::new(PgLoadWriter::new(pool.clone())),
    );

    let first = pipeline.ingest(&"raw/enrollment.csv".into()).await;
    let second = pipeline.ingest(&"raw/enrollment.csv".into()).await;
    assert!(matches!(first, Outcome::Loaded { rows: 1, .. }), "{first:?}");
    assert!(matches!(second, Outcome::Duplicate { .. }), "{second:?}");
    assert_eq!(count(&pool, "Enrollment").await?, 1);

    let (student, name): (Option<String>, Option<String>) =
        sqlx::query_as(r#"SELECT "StudentID", "Name" FROM "Enrollment""#)
            .fetch_one(&pool)
            .await?;
    assert_eq!(student.as_deref(), Some("S-17"));
    assert_eq!(name.as_deref(), Some("Ada Lovelace"));

    let rejected = pipeline.ingest(&"raw/grades.csv".into()).await;
    assert!(matches!(rejected, Outcome::Failed(_)));
    assert_eq!(count(&pool, "Grades").await?, 0);
    assert!(dedup
        .lookup(&fingerprint("StudentID,Course\n1001,CS101\n"))
        .await?
        .is_none());

    Ok(())
}
