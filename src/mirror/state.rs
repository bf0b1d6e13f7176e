// ABOUTME: CheckpointStore for watermark-based mirroring - tracks progress per table
// ABOUTME: Holds the last mirrored primary-key value of every table behind one lock

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Deserializer, Serialize};

use super::reader::KeyDomain;
use super::value::Value;

/// Primary-key value of the last row known to be mirrored for a table.
///
/// Serialized untagged: integers as JSON numbers, timestamps as RFC 3339
/// strings, everything else as plain strings. Every string reads back as
/// `Text`, byte for byte; [`Watermark::in_domain`] reinterprets it once the
/// table's key type is known.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Watermark {
    Integer(i64),
    Timestamp(DateTime<Utc>),
    Text(String),
}

/// On-disk shape of a watermark: a JSON number or a JSON string.
#[derive(Deserialize)]
#[serde(untagged)]
enum StoredWatermark {
    Integer(i64),
    Text(String),
}

impl<'de> Deserialize<'de> for Watermark {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        Ok(match StoredWatermark::deserialize(deserializer)? {
            StoredWatermark::Integer(v) => Watermark::Integer(v),
            StoredWatermark::Text(v) => Watermark::Text(v),
        })
    }
}

impl Watermark {
    /// Reinterpret a watermark for a key of `domain`.
    ///
    /// Hydrated timestamps come back as text and are parsed here. A value
    /// that does not parse is kept as it is and left to the server-side cast.
    pub fn in_domain(self, domain: KeyDomain) -> Self {
        match (domain, self) {
            (KeyDomain::Timestamp, Watermark::Text(v)) => {
                match DateTime::parse_from_rfc3339(&v) {
                    Ok(ts) => Watermark::Timestamp(ts.with_timezone(&Utc)),
                    Err(_) => Watermark::Text(v),
                }
            }
            (KeyDomain::Integer, Watermark::Text(v)) => match v.parse::<i64>() {
                Ok(n) => Watermark::Integer(n),
                Err(_) => Watermark::Text(v),
            },
            (KeyDomain::Text, Watermark::Text(v)) => Watermark::Text(v),
            (KeyDomain::Text, other) => Watermark::Text(other.to_sql_text()),
            (_, other) => other,
        }
    }

    /// Extract the watermark carried by a primary-key value.
    ///
    /// Returns `None` for NULLs and for types that cannot act as a key.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Int(v) => Some(Watermark::Integer(*v)),
            Value::Text(v) => Some(Watermark::Text(v.clone())),
            Value::Timestamp(v) => Some(Watermark::Timestamp(v.and_utc())),
            Value::TimestampTz(v) => Some(Watermark::Timestamp(*v)),
            _ => None,
        }
    }

    /// Text form bound into the range query and cast server-side to the key type.
    pub fn to_sql_text(&self) -> String {
        match self {
            Watermark::Integer(v) => v.to_string(),
            Watermark::Timestamp(v) => v.to_rfc3339_opts(SecondsFormat::AutoSi, true),
            Watermark::Text(v) => v.clone(),
        }
    }

    /// Ordering within one domain; values of different domains don't compare.
    pub fn partial_cmp_domain(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Watermark::Integer(a), Watermark::Integer(b)) => Some(a.cmp(b)),
            (Watermark::Timestamp(a), Watermark::Timestamp(b)) => Some(a.cmp(b)),
            (Watermark::Text(a), Watermark::Text(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_sql_text())
    }
}

impl From<i64> for Watermark {
    fn from(v: i64) -> Self {
        Watermark::Integer(v)
    }
}

impl From<&str> for Watermark {
    fn from(v: &str) -> Self {
        Watermark::Text(v.to_string())
    }
}

/// Concurrency-safe table → watermark map shared by every worker.
///
/// A missing entry means the table has never been mirrored and its next
/// fetch starts from the beginning of the key range.
#[derive(Debug, Default)]
pub struct CheckpointStore {
    tables: RwLock<HashMap<String, Watermark>>,
}

impl CheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current watermark of a table, `None` if it was never advanced.
    pub fn get(&self, table: &str) -> Option<Watermark> {
        self.tables.read().get(table).cloned()
    }

    /// Advance a table's watermark.
    ///
    /// Returns `false` and leaves the entry untouched when an integer or
    /// timestamp `watermark` is below the stored value. Text is accepted as
    /// given: its order is the source's collation, which only the source
    /// knows. A value of a different domain (a table whose key type changed)
    /// replaces the old one.
    pub fn set(&self, table: &str, watermark: Watermark) -> bool {
        let mut tables = self.tables.write();
        if let Some(current) = tables.get(table) {
            let ordered = !matches!(watermark, Watermark::Text(_));
            if ordered && current.partial_cmp_domain(&watermark) == Some(Ordering::Greater) {
                return false;
            }
        }
        tables.insert(table.to_string(), watermark);
        true
    }

    pub fn len(&self) -> usize {
        self.tables.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.read().is_empty()
    }

    /// Get all table names being tracked
    pub fn tables(&self) -> Vec<String> {
        self.tables.read().keys().cloned().collect()
    }

    /// Point-in-time copy of every entry, ordered by table name.
    pub fn snapshot(&self) -> BTreeMap<String, Watermark> {
        self.tables
            .read()
            .iter()
            .map(|(table, watermark)| (table.clone(), watermark.clone()))
            .collect()
    }

    /// Serialize the whole map as a flat JSON object.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(&self.snapshot()).context("Failed to serialize checkpoints")
    }

    /// Replace the map with the contents of a serialized snapshot.
    pub fn hydrate(&self, bytes: &[u8]) -> Result<()> {
        let loaded: HashMap<String, Watermark> =
            serde_json::from_slice(bytes).context("Failed to parse checkpoint snapshot")?;
        *self.tables.write() = loaded;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_missing_table_has_no_watermark() {
        let store = CheckpointStore::new();
        assert!(store.get("users").is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_set_and_get() {
        let store = CheckpointStore::new();
        assert!(store.set("users", Watermark::Integer(10)));
        assert_eq!(store.get("users"), Some(Watermark::Integer(10)));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_set_refuses_to_move_backwards() {
        let store = CheckpointStore::new();
        store.set("users", Watermark::Integer(10));
        assert!(!store.set("users", Watermark::Integer(9)));
        assert_eq!(store.get("users"), Some(Watermark::Integer(10)));

        // Equal is a no-op advance, not a regression
        assert!(store.set("users", Watermark::Integer(10)));
    }

    #[test]
    fn test_set_accepts_domain_change() {
        let store = CheckpointStore::new();
        store.set("events", Watermark::Integer(10));
        assert!(store.set("events", Watermark::from("a")));
        assert_eq!(store.get("events"), Some(Watermark::from("a")));
    }

    #[test]
    fn test_serialized_format_is_flat_object() {
        let store = CheckpointStore::new();
        store.set("users", Watermark::Integer(3));
        store.set("tags", Watermark::from("m"));

        let json: serde_json::Value = serde_json::from_slice(&store.serialize().unwrap()).unwrap();
        assert_eq!(json, serde_json::json!({"users": 3, "tags": "m"}));
    }

    #[test]
    fn test_hydrate_replaces_contents() {
        let store = CheckpointStore::new();
        store.set("stale", Watermark::Integer(1));
        store.hydrate(br#"{"users": 5}"#).unwrap();

        assert!(store.get("stale").is_none());
        assert_eq!(store.get("users"), Some(Watermark::Integer(5)));
    }

    #[test]
    fn test_hydrate_rejects_garbage() {
        let store = CheckpointStore::new();
        store.set("users", Watermark::Integer(1));
        assert!(store.hydrate(b"{not json").is_err());
        // failed hydrate leaves the store untouched
        assert_eq!(store.get("users"), Some(Watermark::Integer(1)));
    }

    #[test]
    fn test_timestamp_watermark_survives_round_trip() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap();
        let store = CheckpointStore::new();
        store.set("events", Watermark::Timestamp(ts));

        let fresh = CheckpointStore::new();
        fresh.hydrate(&store.serialize().unwrap()).unwrap();
        let restored = fresh.get("events").unwrap();
        assert_eq!(
            restored.in_domain(KeyDomain::Timestamp),
            Watermark::Timestamp(ts)
        );
    }

    #[test]
    fn test_timestamp_shaped_text_key_round_trips_verbatim() {
        let key = "2024-03-01T12:30:00.000Z";
        let store = CheckpointStore::new();
        store.set("events", Watermark::from(key));

        let fresh = CheckpointStore::new();
        fresh.hydrate(&store.serialize().unwrap()).unwrap();
        let restored = fresh.get("events").unwrap().in_domain(KeyDomain::Text);
        assert_eq!(restored, Watermark::from(key));
        assert_eq!(restored.to_sql_text(), key);
    }

    #[test]
    fn test_text_watermark_follows_source_order() {
        let store = CheckpointStore::new();
        store.set("tags", Watermark::from("a"));
        // "B" sorts after "a" under a case-insensitive collation
        assert!(store.set("tags", Watermark::from("B")));
        assert_eq!(store.get("tags"), Some(Watermark::from("B")));
    }

    #[test]
    fn test_in_domain_parses_stored_text() {
        assert_eq!(
            Watermark::from("42").in_domain(KeyDomain::Integer),
            Watermark::Integer(42)
        );
        assert_eq!(
            Watermark::Integer(7).in_domain(KeyDomain::Text),
            Watermark::from("7")
        );
        assert_eq!(
            Watermark::from("not a time").in_domain(KeyDomain::Timestamp),
            Watermark::from("not a time")
        );
    }

    #[test]
    fn test_watermark_from_key_values() {
        assert_eq!(
            Watermark::from_value(&Value::Int(4)),
            Some(Watermark::Integer(4))
        );
        assert_eq!(
            Watermark::from_value(&Value::Text("k".to_string())),
            Some(Watermark::from("k"))
        );
        assert_eq!(Watermark::from_value(&Value::Null), None);
        assert_eq!(Watermark::from_value(&Value::Bool(true)), None);
    }

    #[test]
    fn test_watermark_sql_text() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(Watermark::Integer(-3).to_sql_text(), "-3");
        assert_eq!(Watermark::Timestamp(ts).to_sql_text(), "2024-01-02T03:04:05Z");
        assert_eq!(Watermark::from("abc").to_string(), "abc");
    }
}
