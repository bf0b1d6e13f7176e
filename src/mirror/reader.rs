// ABOUTME: Source side of mirroring - table discovery, primary-key resolution, range reads
// ABOUTME: Fetches rows above a table's watermark in ascending key order

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;

use super::state::Watermark;
use super::value::Row;
use crate::error::{SchemaIssue, SyncError};
use crate::filters::TableFilter;
use crate::postgres::PgHandle;
use crate::utils::{qualified_table, quote_ident};

/// Everything the mirroring engine needs from the source database.
#[async_trait]
pub trait TableSource: Send + Sync {
    /// Names of all base tables in the source schema.
    async fn list_tables(&self) -> Result<Vec<String>>;

    /// Primary-key columns of `table` in key order, with their catalog types.
    async fn primary_key_columns(&self, table: &str) -> Result<Vec<KeyColumn>>;

    /// Up to `limit` rows with key strictly greater than `after`, ascending
    /// by key. `after = None` reads from the start of the table.
    async fn fetch_rows(
        &self,
        table: &str,
        key: &PrimaryKey,
        after: Option<&Watermark>,
        limit: usize,
    ) -> Result<Vec<Row>>;
}

/// One column of a primary-key constraint, as reported by the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyColumn {
    pub name: String,
    /// `format_type()` output, e.g. `integer` or `timestamp with time zone`
    pub data_type: String,
}

impl KeyColumn {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
        }
    }
}

/// Value domain of a watermark-capable key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyDomain {
    Integer,
    Text,
    Timestamp,
}

impl KeyDomain {
    /// Map a `format_type()` name onto a domain, `None` if not orderable
    /// in a way we can carry as a watermark.
    pub fn from_type_name(data_type: &str) -> Option<Self> {
        // strip length modifiers such as varchar(255) or timestamp(3)
        let base = match data_type.find('(') {
            Some(idx) => {
                let rest = data_type[idx..]
                    .find(')')
                    .map(|end| &data_type[idx + end + 1..])
                    .unwrap_or("");
                format!("{}{}", data_type[..idx].trim_end(), rest)
            }
            None => data_type.to_string(),
        };

        match base.trim() {
            "smallint" | "integer" | "bigint" => Some(KeyDomain::Integer),
            "text" | "character varying" | "character" | "name" => Some(KeyDomain::Text),
            "timestamp without time zone" | "timestamp with time zone" => {
                Some(KeyDomain::Timestamp)
            }
            _ => None,
        }
    }
}

/// The single orderable primary-key column that drives a table's watermark.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimaryKey {
    pub column: String,
    pub data_type: String,
    pub domain: KeyDomain,
}

impl PrimaryKey {
    /// Pick the watermark column out of a table's primary-key columns.
    ///
    /// Fails for tables without a key, with a composite key, or whose key
    /// type has no usable ordering.
    pub fn resolve(columns: Vec<KeyColumn>) -> Result<Self, SchemaIssue> {
        let mut columns = columns;
        match columns.len() {
            0 => Err(SchemaIssue::NoPrimaryKey),
            1 => {
                let KeyColumn { name, data_type } = columns.remove(0);
                match KeyDomain::from_type_name(&data_type) {
                    Some(domain) => Ok(Self {
                        column: name,
                        data_type,
                        domain,
                    }),
                    None => Err(SchemaIssue::UnsupportedKeyType {
                        column: name,
                        data_type,
                    }),
                }
            }
            _ => Err(SchemaIssue::CompositeKey {
                columns: columns.into_iter().map(|c| c.name).collect(),
            }),
        }
    }

    /// Type the bound watermark text is cast to on the server.
    ///
    /// Integer keys compare against `bigint` so the parameter never
    /// overflows a narrower column type.
    pub fn cast_type(&self) -> &str {
        match self.domain {
            KeyDomain::Integer => "bigint",
            KeyDomain::Text => "text",
            KeyDomain::Timestamp => &self.data_type,
        }
    }
}

/// Resolve the primary key of `table` through `source`.
pub async fn resolve_primary_key(
    source: &dyn TableSource,
    table: &str,
) -> Result<PrimaryKey, SyncError> {
    let columns = source
        .primary_key_columns(table)
        .await
        .map_err(|e| SyncError::Schema {
            table: table.to_string(),
            issue: SchemaIssue::Lookup(e),
        })?;

    PrimaryKey::resolve(columns).map_err(|issue| SyncError::Schema {
        table: table.to_string(),
        issue,
    })
}

/// List the source tables selected by `filter`. Runs once at startup.
pub async fn discover_tables(
    source: &dyn TableSource,
    filter: &TableFilter,
) -> Result<Vec<String>, SyncError> {
    let tables = source
        .list_tables()
        .await
        .map_err(|source| SyncError::Discovery { source })?;
    Ok(filter.apply(tables))
}

/// Build the range query for one tick.
///
/// ```sql
/// SELECT * FROM "schema"."table" WHERE "id" > $1::text::bigint ORDER BY "id" ASC LIMIT $2
/// ```
///
/// Text keys compare and sort under the "C" collation so the server's order
/// is the byte order the checkpoint store uses.
pub fn build_fetch_query(schema: &str, table: &str, key: &PrimaryKey, bounded: bool) -> String {
    let collate = match key.domain {
        KeyDomain::Text => " COLLATE \"C\"",
        KeyDomain::Integer | KeyDomain::Timestamp => "",
    };
    let column = quote_ident(&key.column);
    let table = qualified_table(schema, table);
    if bounded {
        format!(
            "SELECT * FROM {} WHERE {}{} > $1::text::{} ORDER BY {}{} ASC LIMIT $2",
            table,
            column,
            collate,
            key.cast_type(),
            column,
            collate
        )
    } else {
        format!(
            "SELECT * FROM {} ORDER BY {}{} ASC LIMIT $1",
            table, column, collate
        )
    }
}

/// Reads from a PostgreSQL source.
pub struct PgReader {
    handle: Arc<PgHandle>,
    schema: String,
}

impl PgReader {
    pub fn new(handle: Arc<PgHandle>, schema: impl Into<String>) -> Self {
        Self {
            handle,
            schema: schema.into(),
        }
    }
}

#[async_trait]
impl TableSource for PgReader {
    async fn list_tables(&self) -> Result<Vec<String>> {
        let client = self.handle.client().await?;
        let rows = client
            .query(
                "SELECT table_name::text
                 FROM information_schema.tables
                 WHERE table_schema = $1 AND table_type = 'BASE TABLE'",
                &[&self.schema],
            )
            .await
            .with_context(|| format!("Failed to list tables in schema {}", self.schema))?;

        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    async fn primary_key_columns(&self, table: &str) -> Result<Vec<KeyColumn>> {
        let client = self.handle.client().await?;
        let rows = client
            .query(
                "SELECT a.attname::text, format_type(a.atttypid, a.atttypmod)
                 FROM pg_index i
                 JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey)
                 JOIN pg_class c ON c.oid = i.indrelid
                 JOIN pg_namespace n ON n.oid = c.relnamespace
                 WHERE i.indisprimary
                   AND n.nspname = $1
                   AND c.relname = $2
                 ORDER BY array_position(i.indkey, a.attnum)",
                &[&self.schema, &table],
            )
            .await
            .with_context(|| format!("Failed to get primary key for {}.{}", self.schema, table))?;

        Ok(rows
            .iter()
            .map(|row| KeyColumn::new(row.get::<_, String>(0), row.get::<_, String>(1)))
            .collect())
    }

    async fn fetch_rows(
        &self,
        table: &str,
        key: &PrimaryKey,
        after: Option<&Watermark>,
        limit: usize,
    ) -> Result<Vec<Row>> {
        let client = self.handle.client().await?;
        let limit = i64::try_from(limit).context("Chunk size does not fit in a bigint")?;
        let query = build_fetch_query(&self.schema, table, key, after.is_some());

        let rows = match after {
            Some(watermark) => {
                client
                    .query(&query, &[&watermark.to_sql_text(), &limit])
                    .await
            }
            None => client.query(&query, &[&limit]).await,
        }
        .with_context(|| format!("Failed to read rows from {}.{}", self.schema, table))?;

        rows.iter().map(Row::from_pg).collect()
    }
}
