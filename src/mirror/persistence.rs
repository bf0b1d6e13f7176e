// ABOUTME: PersistenceLoop - periodically snapshots the CheckpointStore to disk
// ABOUTME: Writes through a temp file in the same directory, then renames over the old snapshot

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::events::EventReporter;
use super::state::CheckpointStore;
use crate::error::SyncError;

pub const DEFAULT_PERSIST_INTERVAL: Duration = Duration::from_secs(5);

/// Default checkpoint location, relative to the working directory.
pub fn default_state_path() -> PathBuf {
    PathBuf::from(".pg-mirror/checkpoint.json")
}

/// Read a snapshot file. A missing file is `Ok(None)`.
pub async fn read_snapshot(path: &Path) -> Result<Option<Vec<u8>>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("Failed to read checkpoint from {:?}", path)),
    }
}

/// Replace the file at `path` with `bytes` in one rename.
///
/// Readers see either the previous snapshot or the new one, never a
/// partially written file.
pub async fn write_snapshot(path: &Path, bytes: Vec<u8>) -> Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || write_snapshot_blocking(&path, &bytes))
        .await
        .context("Checkpoint writer task panicked")?
}

fn write_snapshot_blocking(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create directory {:?}", dir))?;

    let mut tmp = tempfile::NamedTempFile::new_in(&dir)
        .with_context(|| format!("Failed to create temp file in {:?}", dir))?;
    tmp.write_all(bytes)
        .context("Failed to write checkpoint temp file")?;
    tmp.as_file()
        .sync_all()
        .context("Failed to sync checkpoint temp file")?;
    tmp.persist(path)
        .with_context(|| format!("Failed to move checkpoint into place at {:?}", path))?;
    Ok(())
}

/// Flushes the CheckpointStore to `path` every `period` until shut down.
pub struct PersistenceLoop {
    store: Arc<CheckpointStore>,
    path: PathBuf,
    period: Duration,
    events: EventReporter,
}

impl PersistenceLoop {
    pub fn new(
        store: Arc<CheckpointStore>,
        path: impl Into<PathBuf>,
        period: Duration,
        events: EventReporter,
    ) -> Self {
        Self {
            store,
            path: path.into(),
            period,
            events,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write one snapshot now.
    pub async fn persist_once(&self) -> Result<(), SyncError> {
        let to_error = |source| SyncError::Persistence {
            path: self.path.clone(),
            source,
        };
        let bytes = self.store.serialize().map_err(to_error)?;
        write_snapshot(&self.path, bytes).await.map_err(to_error)
    }

    /// Run until `shutdown` fires, then write a final snapshot.
    ///
    /// A failed write is reported and retried on the next period.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // the first tick completes immediately; nothing to save yet
        ticker.tick().await;

        tracing::debug!(
            "Persisting checkpoints to {:?} every {:?}",
            self.path,
            self.period
        );

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.persist_once().await {
                        tracing::warn!("{}", e);
                        self.events.error(e);
                    }
                }
            }
        }

        match self.persist_once().await {
            Ok(()) => tracing::info!(
                "Saved {} checkpoints to {:?}",
                self.store.len(),
                self.path
            ),
            Err(e) => {
                tracing::error!("Final checkpoint flush failed: {}", e);
                self.events.error(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mirror::events;
    use crate::mirror::state::Watermark;

    #[tokio::test]
    async fn test_read_snapshot_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = read_snapshot(&dir.path().join("nope.json")).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_write_snapshot_creates_parent_and_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/state/checkpoint.json");

        write_snapshot(&path, b"first".to_vec()).await.unwrap();
        write_snapshot(&path, b"second".to_vec()).await.unwrap();

        assert_eq!(read_snapshot(&path).await.unwrap().unwrap(), b"second");
        // no temp files left next to the snapshot
        let entries = std::fs::read_dir(path.parent().unwrap()).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[tokio::test]
    async fn test_persist_once_writes_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.json");
        let store = Arc::new(CheckpointStore::new());
        store.set("users", Watermark::Integer(7));

        let (reporter, _stream) = events::channel(4);
        let persistence = PersistenceLoop::new(store, &path, DEFAULT_PERSIST_INTERVAL, reporter);
        persistence.persist_once().await.unwrap();

        let json: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(json, serde_json::json!({"users": 7}));
    }

    #[tokio::test]
    async fn test_persist_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        // a regular file where the parent directory should be
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"").unwrap();

        let (reporter, _stream) = events::channel(4);
        let persistence = PersistenceLoop::new(
            Arc::new(CheckpointStore::new()),
            blocker.join("checkpoint.json"),
            DEFAULT_PERSIST_INTERVAL,
            reporter,
        );

        match persistence.persist_once().await {
            Err(SyncError::Persistence { path, .. }) => {
                assert_eq!(path, blocker.join("checkpoint.json"));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_run_flushes_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.json");
        let store = Arc::new(CheckpointStore::new());
        store.set("orders", Watermark::from("k-9"));

        let (reporter, _stream) = events::channel(4);
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        PersistenceLoop::new(store, &path, Duration::from_secs(3600), reporter)
            .run(shutdown)
            .await;

        let json: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(json, serde_json::json!({"orders": "k-9"}));
    }
}
