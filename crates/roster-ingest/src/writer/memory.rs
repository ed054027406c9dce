//! In-memory load writer with failure injection

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::LoadWriter;
use crate::error::LoadError;
use crate::types::{LoadAck, LoadBatch, ParsedRow};

#[derive(Debug, Default)]
struct Table {
    columns: Vec<String>,
    rows: Vec<ParsedRow>,
}

/// Keeps committed rows per table. Used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryLoadWriter {
    tables: Mutex<HashMap<String, Table>>,
    fail_next: Mutex<Option<LoadError>>,
    delay: Option<Duration>,
    batches: AtomicUsize,
}

impl MemoryLoadWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold every insert for `delay` before applying it
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    /// Make the next insert fail with `error` and leave every table untouched
    pub fn fail_next(&self, error: LoadError) {
        if let Ok(mut slot) = self.fail_next.lock() {
            *slot = Some(error);
        }
    }

    /// Committed rows of `table`, in insert order
    pub fn rows(&self, table: &str) -> Vec<ParsedRow> {
        self.tables
            .lock()
            .ok()
            .and_then(|tables| tables.get(table).map(|t| t.rows.clone()))
            .unwrap_or_default()
    }

    /// Column list of the last batch committed to `table`
    pub fn columns(&self, table: &str) -> Vec<String> {
        self.tables
            .lock()
            .ok()
            .and_then(|tables| tables.get(table).map(|t| t.columns.clone()))
            .unwrap_or_default()
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.rows(table).len()
    }

    /// Number of successfully committed batches
    pub fn batch_count(&self) -> usize {
        self.batches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LoadWriter for MemoryLoadWriter {
    async fn insert_batch(&self, batch: &LoadBatch) -> Result<LoadAck, LoadError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let injected = self
            .fail_next
            .lock()
            .map_err(|_| LoadError::transient("writer state lock poisoned"))?
            .take();
        if let Some(error) = injected {
            return Err(error);
        }

        if let Some(row) = batch.rows.iter().find(|row| row.len() != batch.columns.len()) {
            return Err(LoadError::permanent(format!(
                "row has {} values for {} columns",
                row.len(),
                batch.columns.len()
            )));
        }

        let mut tables = self
            .tables
            .lock()
            .map_err(|_| LoadError::transient("writer state lock poisoned"))?;
        let table = tables.entry(batch.table.clone()).or_default();
        table.columns = batch.columns.clone();
        table.rows.extend(batch.rows.iter().cloned());
        self.batches.fetch_add(1, Ordering::SeqCst);

        Ok(LoadAck {
            rows_inserted: batch.row_count(),
        })
    }
}
