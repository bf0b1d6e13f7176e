// ABOUTME: Checkpoint snapshot tests - on-disk format, round trips and damaged files
// ABOUTME: Exercises CheckpointStore together with the persistence helpers

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use pg_mirror::mirror::events;
use pg_mirror::mirror::persistence::{read_snapshot, write_snapshot, PersistenceLoop};
use pg_mirror::mirror::{CheckpointStore, KeyDomain, Watermark};
use tempfile::TempDir;

#[tokio::test]
async fn test_snapshot_round_trip_through_disk() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("checkpoint.json");

    let store = Arc::new(CheckpointStore::new());
    store.set("users", Watermark::Integer(42));
    store.set("tags", Watermark::from("zebra"));
    store.set(
        "events",
        Watermark::Timestamp(Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap()),
    );

    let (reporter, _stream) = events::channel(8);
    PersistenceLoop::new(store.clone(), &path, Duration::from_secs(5), reporter)
        .persist_once()
        .await
        .unwrap();

    let restored = CheckpointStore::new();
    restored
        .hydrate(&read_snapshot(&path).await.unwrap().unwrap())
        .unwrap();
    assert_eq!(restored.get("users"), Some(Watermark::Integer(42)));
    assert_eq!(restored.get("tags"), Some(Watermark::from("zebra")));
    // strings come back as text; the worker reads them in its key's domain
    assert_eq!(
        restored
            .get("events")
            .map(|w| w.in_domain(KeyDomain::Timestamp)),
        store.get("events")
    );
}

#[tokio::test]
async fn test_snapshot_file_is_flat_json_object() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("state").join("checkpoint.json");

    let store = CheckpointStore::new();
    store.set("users", Watermark::Integer(3));
    store.set(
        "events",
        Watermark::Timestamp(Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap()),
    );
    write_snapshot(&path, store.serialize().unwrap()).await.unwrap();

    let json: serde_json::Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    assert_eq!(
        json,
        serde_json::json!({"users": 3, "events": "2024-01-02T03:04:05Z"})
    );
}

#[tokio::test]
async fn test_hand_written_snapshot_is_accepted() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("checkpoint.json");
    std::fs::write(
        &path,
        r#"{"users": 17, "sessions": "2023-12-31T23:59:59.5+00:00", "tags": "m"}"#,
    )
    .unwrap();

    let store = CheckpointStore::new();
    store
        .hydrate(&read_snapshot(&path).await.unwrap().unwrap())
        .unwrap();

    assert_eq!(store.get("users"), Some(Watermark::Integer(17)));
    assert_eq!(
        store.get("sessions"),
        Some(Watermark::from("2023-12-31T23:59:59.5+00:00"))
    );
    assert!(matches!(
        store
            .get("sessions")
            .map(|w| w.in_domain(KeyDomain::Timestamp)),
        Some(Watermark::Timestamp(_))
    ));
    assert_eq!(store.get("tags"), Some(Watermark::from("m")));
}

#[tokio::test]
async fn test_missing_snapshot_is_not_an_error() {
    let dir = TempDir::new().unwrap();
    let snapshot = read_snapshot(&dir.path().join("never-written.json"))
        .await
        .unwrap();
    assert!(snapshot.is_none());
}

#[tokio::test]
async fn test_truncated_snapshot_is_rejected() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("checkpoint.json");
    std::fs::write(&path, br#"{"users": 1, "ord"#).unwrap();

    let store = CheckpointStore::new();
    let bytes = read_snapshot(&path).await.unwrap().unwrap();
    assert!(store.hydrate(&bytes).is_err());
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_rewrite_replaces_previous_snapshot() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("checkpoint.json");

    let store = Arc::new(CheckpointStore::new());
    let (reporter, _stream) = events::channel(8);
    let persistence = PersistenceLoop::new(store.clone(), &path, Duration::from_secs(5), reporter);

    store.set("users", Watermark::Integer(1));
    store.set("orders", Watermark::Integer(1));
    persistence.persist_once().await.unwrap();

    store.set("users", Watermark::Integer(9));
    persistence.persist_once().await.unwrap();

    let restored = CheckpointStore::new();
    restored
        .hydrate(&read_snapshot(&path).await.unwrap().unwrap())
        .unwrap();
    assert_eq!(restored.get("users"), Some(Watermark::Integer(9)));
    assert_eq!(restored.len(), 2);
}
