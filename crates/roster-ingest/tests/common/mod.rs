//! Shared fixtures for integration tests
#![allow(dead_code)]

use roster_ingest::dedup::MemoryDedupStore;
use roster_ingest::fetcher::MemoryFetcher;
use roster_ingest::registry::SchemaRegistry;
use roster_ingest::writer::MemoryLoadWriter;
use roster_ingest::IngestionPipeline;
use std::sync::Arc;
use std::time::Duration;

pub const GRADES_CSV: &str = "StudentID,Course,Grade\n1001,CS101,A\n1002,CS101,B+\n";

pub const ATTENDANCE_CSV: &str = "StudentID,Date,Status\n1001,2024-09-02,Present\n";

pub const ENROLLMENT_NAME_FIRST_CSV: &str =
    "Name,StudentID,Program,EnrollmentDate,Department\nAda Lovelace,S-17,BSc,2024-08-01,CSE\n";

/// Initialize tracing for tests
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,roster_ingest=debug")),
        )
        .with_test_writer()
        .try_init();
}

/// Pipeline wired to in-memory collaborators
pub struct Harness {
    pub fetcher: Arc<MemoryFetcher>,
    pub dedup: Arc<MemoryDedupStore>,
    pub writer: Arc<MemoryLoadWriter>,
    pub pipeline: IngestionPipeline,
}

impl Harness {
    pub fn new() -> Self {
        Self::build(Duration::from_secs(600), MemoryLoadWriter::new())
    }

    pub fn with_writer(writer: MemoryLoadWriter) -> Self {
        Self::build(Duration::from_secs(600), writer)
    }

    pub fn with_reservation_ttl(ttl: Duration) -> Self {
        Self::build(ttl, MemoryLoadWriter::new())
    }

    fn build(ttl: Duration, writer: MemoryLoadWriter) -> Self {
        init_tracing();

        let fetcher = Arc::new(MemoryFetcher::new());
        let dedup = Arc::new(MemoryDedupStore::new(ttl));
        let writer = Arc::new(writer);
        let pipeline = IngestionPipeline::new(
            Arc::new(SchemaRegistry::builtin()),
            fetcher.clone(),
            dedup.clone(),
            writer.clone(),
        );

        Self {
            fetcher,
            dedup,
            writer,
            pipeline,
        }
    }

    pub fn put(&self, path: &str, content: &str) {
        self.fetcher.insert(path, content);
    }
}

/// Rows of `table` as plain string vectors
pub fn table(writer: &MemoryLoadWriter, table: &str) -> Vec<Vec<String>> {
    writer
        .rows(table)
        .into_iter()
        .map(|row| row.values().to_vec())
        .collect()
}
