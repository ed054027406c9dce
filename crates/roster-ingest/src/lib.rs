//! Roster Ingest Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Loads CSV roster files (enrollment, attendance, grades) into Postgres.
//! Each delivery notification names one blob; the pipeline fetches it,
//! fingerprints the bytes, validates the header against the file's contract
//! and inserts all rows in one transaction. A content fingerprint ledger
//! makes redelivered or re-uploaded files load at most once.
//!
//! # Modules
//!
//! - [`registry`]: file name to column contract mapping
//! - [`fetcher`]: blob retrieval (S3, HTTP, local directory)
//! - [`validator`]: CSV header and row validation
//! - [`dedup`]: fingerprint reservations
//! - [`writer`]: transactional batch insert
//! - [`pipeline`]: the per-file orchestrator
//! - [`queue`] / [`worker`]: notification polling and delivery settlement
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use roster_ingest::dedup::MemoryDedupStore;
//! use roster_ingest::fetcher::MemoryFetcher;
//! use roster_ingest::registry::SchemaRegistry;
//! use roster_ingest::writer::MemoryLoadWriter;
//! use roster_ingest::IngestionPipeline;
//!
//! # async fn demo() {
//! let fetcher = Arc::new(MemoryFetcher::new());
//! fetcher.insert("raw/grades.csv", "StudentID,Course,Grade\n1001,CS101,A\n");
//!
//! let pipeline = IngestionPipeline::new(
//!     Arc::new(SchemaRegistry::builtin()),
//!     fetcher,
//!     Arc::new(MemoryDedupStore::new(Duration::from_secs(600))),
//!     Arc::new(MemoryLoadWriter::new()),
//! );
//!
//! let outcome = pipeline.ingest(&"raw/grades.csv".into()).await;
//! assert!(outcome.is_success());
//! # }
//! ```

pub mod config;
pub mod dedup;
pub mod error;
pub mod fetcher;
pub mod pipeline;
pub mod queue;
pub mod registry;
pub mod types;
pub mod validator;
pub mod worker;
pub mod writer;

pub use error::{ErrorClass, IngestError};
pub use pipeline::{IngestionPipeline, Outcome, OutcomeReport, SkipReason};
pub use types::FileReference;
