//! Batch loading into destination tables
//!
//! A writer inserts every row of a [`LoadBatch`] in one transaction: on
//! success all rows are visible, on failure none are.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;

use crate::error::LoadError;
use crate::types::{LoadAck, LoadBatch};

pub use memory::MemoryLoadWriter;
pub use postgres::PgLoadWriter;

#[async_trait]
pub trait LoadWriter: Send + Sync {
    /// Insert all rows of `batch` atomically.
    ///
    /// An empty batch commits nothing and acknowledges zero rows.
    async fn insert_batch(&self, batch: &LoadBatch) -> Result<LoadAck, LoadError>;
}
