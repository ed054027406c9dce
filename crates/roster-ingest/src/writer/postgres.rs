//! Postgres load writer
//!
//! Rows are inserted with multi-row `INSERT .. VALUES` statements inside one
//! transaction. Large files are split into several statements so each stays
//! under the protocol's bind parameter limit; the transaction still makes
//! the whole file atomic.

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, QueryBuilder};

use super::LoadWriter;
use crate::error::LoadError;
use crate::registry::is_identifier;
use crate::types::{LoadAck, LoadBatch, ParsedRow};

/// Postgres accepts at most this many bind parameters per statement
const MAX_BIND_PARAMS: usize = 65_535;

pub struct PgLoadWriter {
    pool: PgPool,
}

impl PgLoadWriter {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LoadWriter for PgLoadWriter {
    async fn insert_batch(&self, batch: &LoadBatch) -> Result<LoadAck, LoadError> {
        if batch.columns.is_empty() {
            return Err(LoadError::permanent("batch has no columns"));
        }
        for name in std::iter::once(&batch.table).chain(batch.columns.iter()) {
            if !is_identifier(name) {
                return Err(LoadError::permanent(format!("invalid identifier '{}'", name)));
            }
        }

        let rows_per_statement = (MAX_BIND_PARAMS / batch.columns.len()).max(1);

        let mut tx = self.pool.begin().await.map_err(classify)?;
        let mut rows_inserted = 0usize;

        for chunk in batch.rows.chunks(rows_per_statement) {
            let mut builder = insert_statement(&batch.table, &batch.columns, chunk);
            let result = builder.build().execute(&mut *tx).await.map_err(classify)?;
            rows_inserted += result.rows_affected() as usize;
        }

        tx.commit().await.map_err(classify)?;

        tracing::debug!(
            table = %batch.table,
            rows = rows_inserted,
            "Committed batch"
        );

        Ok(LoadAck { rows_inserted })
    }
}

fn insert_statement<'a>(
    table: &str,
    columns: &[String],
    rows: &'a [ParsedRow],
) -> QueryBuilder<'a, Postgres> {
    let column_list = columns
        .iter()
        .map(|c| quote_identifier(c))
        .collect::<Vec<_>>()
        .join(", ");

    let mut builder = QueryBuilder::new(format!(
        "INSERT INTO {} ({}) ",
        quote_identifier(table),
        column_list
    ));

    builder.push_values(rows, |mut b, row| {
        for value in row.values() {
            // An empty CSV field loads as NULL
            let value: Option<&str> = if value.is_empty() { None } else { Some(value) };
            b.push_bind(value);
        }
    });

    builder
}

fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Data and constraint violations will fail again on retry; everything else
/// (connection loss, pool timeout, serialization conflicts) may not.
fn classify(err: sqlx::Error) -> LoadError {
    let permanent = match &err {
        sqlx::Error::Database(db) => db
            .code()
            .map(|code| is_permanent_sqlstate(&code))
            .unwrap_or(false),
        sqlx::Error::ColumnNotFound(_) | sqlx::Error::TypeNotFound { .. } => true,
        _ => false,
    };

    if permanent {
        LoadError::permanent(err.to_string())
    } else {
        LoadError::transient(err.to_string())
    }
}

/// SQLSTATE classes 22 (data exception), 23 (integrity constraint) and
/// 42 (syntax error or access rule violation)
fn is_permanent_sqlstate(code: &str) -> bool {
    matches!(code.get(..2), Some("22" | "23" | "42"))
}
