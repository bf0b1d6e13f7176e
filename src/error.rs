// ABOUTME: Error taxonomy for the mirroring engine
// ABOUTME: Separates fatal startup/schema failures from retryable per-tick failures

use std::path::PathBuf;

/// Everything the mirroring engine can report.
///
/// Only [`SyncError::Connection`] (at startup) and [`SyncError::Schema`] (for
/// one table) are fatal; every other variant is reported and retried on the
/// next tick or persistence period.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("failed to connect to {endpoint}: {source:#}")]
    Connection {
        endpoint: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to discover tables: {source:#}")]
    Discovery {
        #[source]
        source: anyhow::Error,
    },

    #[error("[sync:{table}] {issue}")]
    Schema { table: String, issue: SchemaIssue },

    #[error("[sync:{table}] failed to query table > {source:#}")]
    Query {
        table: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("[sync:{table}] failed to insert row with key {key} > {source:#}")]
    Insert {
        table: String,
        key: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("checkpoint persistence failed for {}: {source:#}", .path.display())]
    Persistence {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },
}

impl SyncError {
    /// Table the error belongs to, if it is scoped to one.
    pub fn table(&self) -> Option<&str> {
        match self {
            SyncError::Schema { table, .. }
            | SyncError::Query { table, .. }
            | SyncError::Insert { table, .. } => Some(table),
            _ => None,
        }
    }

    /// Whether the failing component stops for good.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::Connection { .. } | SyncError::Schema { .. })
    }
}

/// Why a table's primary key cannot drive a watermark.
#[derive(Debug, thiserror::Error)]
pub enum SchemaIssue {
    #[error("table has no primary key")]
    NoPrimaryKey,

    #[error("composite primary keys are unsupported ({})", .columns.join(", "))]
    CompositeKey { columns: Vec<String> },

    #[error("primary key column {column} has unsupported type {data_type}")]
    UnsupportedKeyType { column: String, data_type: String },

    #[error("failed to look up primary key > {0:#}")]
    Lookup(#[source] anyhow::Error),
}
