// ABOUTME: TableWorker - runs the fetch/insert/advance cycle for one table
// ABOUTME: Advances the watermark row by row and never past a failed insert

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::events::EventReporter;
use super::reader::{resolve_primary_key, PrimaryKey, TableSource};
use super::state::{CheckpointStore, Watermark};
use super::writer::TableSink;
use crate::error::SyncError;
use crate::metrics::MirrorMetrics;

/// Lifecycle of a table worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Resolving,
    Polling,
    /// Primary-key resolution failed; the table stays unmirrored.
    Failed,
    Stopped,
}

/// Tick timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    /// Cap for the extra delay after consecutive failed ticks. `None` keeps
    /// the fixed interval no matter what.
    pub max_backoff: Option<Duration>,
}

impl PollPolicy {
    pub fn fixed(interval: Duration) -> Self {
        Self {
            interval,
            max_backoff: None,
        }
    }

    /// Extra wait on top of the interval after `consecutive_failures` failed
    /// ticks in a row: `min(interval * 2^(n-1), max_backoff)`.
    pub fn backoff_delay(&self, consecutive_failures: u32) -> Duration {
        match self.max_backoff {
            Some(max) if consecutive_failures > 0 => {
                let exponent = (consecutive_failures - 1).min(16);
                self.interval
                    .checked_mul(1u32 << exponent)
                    .unwrap_or(max)
                    .min(max)
            }
            _ => Duration::ZERO,
        }
    }
}

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickOutcome {
    pub fetched: usize,
    /// Rows actually written; replayed rows the destination already holds
    /// are not counted.
    pub inserted: u64,
    pub failed: u64,
    /// Watermark after the tick, `None` if the table was never advanced.
    pub watermark: Option<Watermark>,
}

/// Per-worker settings, derived from the mirror configuration.
#[derive(Debug, Clone, Copy)]
pub struct WorkerConfig {
    pub chunk_size: usize,
    pub poll: PollPolicy,
}

/// Mirrors one table for as long as the process runs.
pub struct TableWorker {
    table: String,
    source: Arc<dyn TableSource>,
    sink: Arc<dyn TableSink>,
    store: Arc<CheckpointStore>,
    events: EventReporter,
    metrics: Option<Arc<MirrorMetrics>>,
    config: WorkerConfig,
    state: WorkerState,
}

impl TableWorker {
    pub fn new(
        table: impl Into<String>,
        source: Arc<dyn TableSource>,
        sink: Arc<dyn TableSink>,
        store: Arc<CheckpointStore>,
        events: EventReporter,
        config: WorkerConfig,
    ) -> Self {
        Self {
            table: table.into(),
            source,
            sink,
            store,
            events,
            metrics: None,
            config,
            state: WorkerState::Resolving,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MirrorMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Resolve the table's primary key. On failure the worker is `Failed`.
    pub async fn resolve(&mut self) -> Result<PrimaryKey, SyncError> {
        match resolve_primary_key(self.source.as_ref(), &self.table).await {
            Ok(key) => {
                self.state = WorkerState::Polling;
                Ok(key)
            }
            Err(e) => {
                self.state = WorkerState::Failed;
                Err(e)
            }
        }
    }

    /// Run until cancelled, or until key resolution fails.
    ///
    /// Ticks of one worker never overlap: the next tick starts only after
    /// the previous one finished, and timer firings missed in the meantime
    /// are skipped.
    pub async fn run(mut self, shutdown: CancellationToken) -> WorkerState {
        let resolved = tokio::select! {
            biased;
            _ = shutdown.cancelled() => None,
            resolved = resolve_primary_key(self.source.as_ref(), &self.table) => Some(resolved),
        };

        let key = match resolved {
            None => {
                self.state = WorkerState::Stopped;
                return self.state;
            }
            Some(Ok(key)) => {
                self.state = WorkerState::Polling;
                key
            }
            Some(Err(e)) => {
                self.state = WorkerState::Failed;
                tracing::warn!("Not mirroring {}: {}", self.table, e);
                self.events.error(e);
                return self.state;
            }
        };

        tracing::debug!(
            "Mirroring {} by {} ({}) every {:?}",
            self.table,
            key.column,
            key.data_type,
            self.config.poll.interval
        );

        let mut ticker = interval(self.config.poll.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut consecutive_failures = 0u32;

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let result = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                result = self.tick(&key) => result,
            };

            match result {
                Ok(_) => consecutive_failures = 0,
                Err(e) => {
                    consecutive_failures = consecutive_failures.saturating_add(1);
                    self.events.error(e);

                    let delay = self.config.poll.backoff_delay(consecutive_failures);
                    if !delay.is_zero() {
                        tokio::select! {
                            biased;
                            _ = shutdown.cancelled() => break,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            }
        }

        tracing::debug!("Stopped mirroring {}", self.table);
        self.state = WorkerState::Stopped;
        self.state
    }

    /// One fetch → insert → advance cycle.
    ///
    /// A failed fetch abandons the tick with the watermark untouched. A
    /// failed insert is reported and the remaining rows are still written,
    /// but the watermark stays below the failed row so the next tick
    /// fetches it again.
    pub async fn tick(&self, key: &PrimaryKey) -> Result<TickOutcome, SyncError> {
        let since = self
            .store
            .get(&self.table)
            .map(|watermark| watermark.in_domain(key.domain));

        let rows = self
            .source
            .fetch_rows(&self.table, key, since.as_ref(), self.config.chunk_size)
            .await
            .map_err(|source| SyncError::Query {
                table: self.table.clone(),
                source,
            })?;

        self.events.info(
            Some(&self.table),
            match &since {
                Some(w) => format!("syncing with {} > {}", key.column, w),
                None => format!("syncing with {} from the beginning", key.column),
            },
        );

        let mut outcome = TickOutcome {
            fetched: rows.len(),
            ..TickOutcome::default()
        };
        let mut blocked = false;

        for row in &rows {
            let watermark = match row.get(&key.column).and_then(Watermark::from_value) {
                Some(watermark) => watermark,
                None => {
                    // Can't place this row on the key range; treat like a failed insert.
                    outcome.failed += 1;
                    blocked = true;
                    self.events.error(SyncError::Insert {
                        table: self.table.clone(),
                        key: "<missing>".to_string(),
                        source: anyhow::anyhow!(
                            "row has no usable value for key column {}",
                            key.column
                        ),
                    });
                    continue;
                }
            };

            match self.sink.insert_row(&self.table, row).await {
                Ok(written) => {
                    // 0 when the row was already there
                    outcome.inserted += written;
                    if !blocked {
                        self.store.set(&self.table, watermark);
                    }
                }
                Err(source) => {
                    outcome.failed += 1;
                    blocked = true;
                    self.events.error(SyncError::Insert {
                        table: self.table.clone(),
                        key: watermark.to_string(),
                        source,
                    });
                }
            }
        }

        if let Some(metrics) = &self.metrics {
            metrics.record_tick(&self.table, outcome.inserted, outcome.failed);
        }

        outcome.watermark = self.store.get(&self.table);
        Ok(outcome)
    }
}
