// ABOUTME: Destination side of mirroring - inserts fetched rows one at a time
// ABOUTME: Uses INSERT ... ON CONFLICT DO NOTHING so replayed rows are absorbed

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;

use super::value::Row;
use crate::postgres::PgHandle;
use crate::utils::{qualified_table, quote_ident};

/// Everything the mirroring engine needs from the destination database.
#[async_trait]
pub trait TableSink: Send + Sync {
    /// Insert one row into the destination table of the same name.
    ///
    /// Returns the number of rows written; 0 means the row was already there.
    async fn insert_row(&self, table: &str, row: &Row) -> Result<u64>;
}

/// Build a single-row insert for the given columns.
///
/// Generates a query like:
/// ```sql
/// INSERT INTO "schema"."table" ("col1", "col2") VALUES ($1, $2) ON CONFLICT DO NOTHING
/// ```
pub fn build_insert_query(schema: &str, table: &str, columns: &[String]) -> String {
    let quoted_columns: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("${}", i)).collect();

    format!(
        "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT DO NOTHING",
        qualified_table(schema, table),
        quoted_columns.join(", "),
        placeholders.join(", ")
    )
}

/// Writes to a PostgreSQL destination.
///
/// Each row is its own autocommitted statement; there is no transaction
/// spanning a batch.
pub struct PgWriter {
    handle: Arc<PgHandle>,
    schema: String,
}

impl PgWriter {
    pub fn new(handle: Arc<PgHandle>, schema: impl Into<String>) -> Self {
        Self {
            handle,
            schema: schema.into(),
        }
    }
}

#[async_trait]
impl TableSink for PgWriter {
    async fn insert_row(&self, table: &str, row: &Row) -> Result<u64> {
        if row.is_empty() {
            bail!("Refusing to insert a row without columns into {}", table);
        }

        let client = self.handle.client().await?;
        let query = build_insert_query(&self.schema, table, row.columns());
        let affected = client
            .execute(&query, &row.params())
            .await
            .with_context(|| format!("Failed to insert row into {}.{}", self.schema, table))?;

        Ok(affected)
    }
}
