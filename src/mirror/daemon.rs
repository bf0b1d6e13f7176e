// ABOUTME: Mirror orchestrator - hydrates checkpoints, discovers tables, spawns workers
// ABOUTME: MirrorHandle cancels and joins every spawned task on shutdown

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::events::{self, EventReporter, EventStream, DEFAULT_EVENT_BUFFER};
use super::persistence::{
    default_state_path, read_snapshot, PersistenceLoop, DEFAULT_PERSIST_INTERVAL,
};
use super::reader::{discover_tables, TableSource};
use super::state::CheckpointStore;
use super::worker::{PollPolicy, TableWorker, WorkerConfig, WorkerState};
use super::writer::TableSink;
use crate::error::SyncError;
use crate::filters::TableFilter;
use crate::metrics::MirrorMetrics;

/// Configuration for a [`Mirror`].
#[derive(Debug, Clone)]
pub struct MirrorConfig {
    /// Interval between ticks of each table worker
    pub sync_interval: Duration,
    /// Maximum rows fetched per tick
    pub chunk_size: usize,
    /// Where checkpoints are persisted
    pub state_path: PathBuf,
    pub persist_interval: Duration,
    /// Source schema holding the mirrored tables
    pub schema: String,
    pub filter: TableFilter,
    /// Events buffered before new ones are dropped
    pub event_buffer: usize,
    /// Cap for backoff after failed ticks; `None` polls at a fixed interval
    pub max_backoff: Option<Duration>,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_secs(60),
            chunk_size: 1000,
            state_path: default_state_path(),
            persist_interval: DEFAULT_PERSIST_INTERVAL,
            schema: "public".to_string(),
            filter: TableFilter::empty(),
            event_buffer: DEFAULT_EVENT_BUFFER,
            max_backoff: None,
        }
    }
}

impl MirrorConfig {
    fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            chunk_size: self.chunk_size.max(1),
            poll: PollPolicy {
                interval: self.sync_interval,
                max_backoff: self.max_backoff,
            },
        }
    }
}

/// Mirrors every selected table of a source into a destination.
pub struct Mirror {
    config: MirrorConfig,
    source: Arc<dyn TableSource>,
    sink: Arc<dyn TableSink>,
    store: Arc<CheckpointStore>,
    metrics: Option<Arc<MirrorMetrics>>,
}

impl Mirror {
    pub fn new(
        config: MirrorConfig,
        source: Arc<dyn TableSource>,
        sink: Arc<dyn TableSink>,
    ) -> Self {
        Self {
            config,
            source,
            sink,
            store: Arc::new(CheckpointStore::new()),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MirrorMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// The shared checkpoint map.
    pub fn checkpoints(&self) -> Arc<CheckpointStore> {
        self.store.clone()
    }

    /// Hydrate checkpoints, discover tables and spawn one worker per table
    /// plus the persistence loop.
    ///
    /// Discovery failure is reported on the returned stream and nothing is
    /// spawned; the handle then holds no tasks.
    pub async fn start(self) -> (MirrorHandle, EventStream) {
        let (reporter, stream) = events::channel(self.config.event_buffer);
        let shutdown = CancellationToken::new();

        tracing::info!(
            "Starting mirror with sync_interval={:?}, chunk_size={}, state_path={:?}",
            self.config.sync_interval,
            self.config.chunk_size,
            self.config.state_path
        );

        self.hydrate(&reporter).await;

        let tables = match discover_tables(self.source.as_ref(), &self.config.filter).await {
            Ok(tables) => tables,
            Err(e) => {
                tracing::error!("{}", e);
                reporter.error(e);
                return (
                    MirrorHandle {
                        workers: Vec::new(),
                        persistence: None,
                        shutdown,
                        tables: Vec::new(),
                    },
                    stream,
                );
            }
        };

        if tables.is_empty() {
            tracing::warn!("No tables selected in schema {}", self.config.schema);
        } else {
            tracing::info!("Mirroring {} tables: {}", tables.len(), tables.join(", "));
        }

        let worker_config = self.config.worker_config();
        let workers = tables
            .iter()
            .map(|table| {
                let mut worker = TableWorker::new(
                    table.clone(),
                    self.source.clone(),
                    self.sink.clone(),
                    self.store.clone(),
                    reporter.clone(),
                    worker_config,
                );
                if let Some(metrics) = &self.metrics {
                    worker = worker.with_metrics(metrics.clone());
                }
                tokio::spawn(worker.run(shutdown.child_token()))
            })
            .collect();

        let persistence = PersistenceLoop::new(
            self.store.clone(),
            self.config.state_path.clone(),
            self.config.persist_interval,
            reporter,
        );
        let persistence = tokio::spawn(persistence.run(shutdown.child_token()));

        (
            MirrorHandle {
                workers,
                persistence: Some(persistence),
                shutdown,
                tables,
            },
            stream,
        )
    }

    async fn hydrate(&self, reporter: &EventReporter) {
        let path = &self.config.state_path;
        let loaded = match read_snapshot(path).await {
            Ok(Some(bytes)) => self.store.hydrate(&bytes),
            Ok(None) => {
                tracing::info!("No checkpoint at {:?}, starting every table from scratch", path);
                return;
            }
            Err(e) => Err(e),
        };

        match loaded {
            Ok(()) => tracing::info!(
                "Loaded {} checkpoints from {:?}",
                self.store.len(),
                path
            ),
            Err(source) => {
                tracing::warn!("Ignoring unreadable checkpoint at {:?}: {:#}", path, source);
                reporter.error(SyncError::Persistence {
                    path: path.clone(),
                    source,
                });
            }
        }
    }
}

/// Running mirror: every spawned task and the token that stops them.
pub struct MirrorHandle {
    workers: Vec<JoinHandle<WorkerState>>,
    persistence: Option<JoinHandle<()>>,
    shutdown: CancellationToken,
    tables: Vec<String>,
}

impl MirrorHandle {
    /// Tables a worker was started for.
    pub fn tables(&self) -> &[String] {
        &self.tables
    }

    /// Whether anything was started (false after a failed discovery).
    pub fn is_running(&self) -> bool {
        self.persistence.is_some()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Keep mirroring until `signal` resolves, then shut down.
    ///
    /// Waits for the signal even when nothing was started, so a failed
    /// discovery leaves the process idle instead of exiting.
    pub async fn run_until<F>(self, signal: F) -> Vec<WorkerState>
    where
        F: std::future::Future<Output = ()>,
    {
        if !self.is_running() {
            tracing::warn!("No tables are being mirrored; waiting for shutdown");
        }
        signal.await;
        self.shutdown().await
    }

    /// Cancel every task and wait for them. The persistence loop writes a
    /// final snapshot before it exits.
    ///
    /// Returns the final state of each worker, in table order.
    pub async fn shutdown(self) -> Vec<WorkerState> {
        self.shutdown.cancel();

        let states = futures::future::join_all(self.workers)
            .await
            .into_iter()
            .map(|joined| match joined {
                Ok(state) => state,
                Err(e) => {
                    tracing::error!("Table worker panicked: {}", e);
                    WorkerState::Failed
                }
            })
            .collect();

        if let Some(persistence) = self.persistence {
            if let Err(e) = persistence.await {
                tracing::error!("Persistence loop panicked: {}", e);
            }
        }

        tracing::info!("Mirror stopped");
        states
    }
}
