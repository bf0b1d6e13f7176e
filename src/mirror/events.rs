// ABOUTME: EventReporter - single funnel for errors and progress lines from every task
// ABOUTME: Bounded and non-blocking so a slow consumer never stalls a table worker

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::error::SyncError;

/// Default number of events buffered before new ones are dropped.
pub const DEFAULT_EVENT_BUFFER: usize = 1024;

#[derive(Debug)]
pub enum SyncEvent {
    Error(SyncError),
    Info {
        table: Option<String>,
        message: String,
    },
}

impl SyncEvent {
    pub fn table(&self) -> Option<&str> {
        match self {
            SyncEvent::Error(err) => err.table(),
            SyncEvent::Info { table, .. } => table.as_deref(),
        }
    }
}

/// Producer side, cloned into every worker and the persistence loop.
#[derive(Debug, Clone)]
pub struct EventReporter {
    tx: mpsc::Sender<SyncEvent>,
    dropped: Arc<AtomicU64>,
}

/// Consumer side, handed to the host process.
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::Receiver<SyncEvent>,
    dropped: Arc<AtomicU64>,
}

/// Create a reporter/stream pair buffering up to `capacity` events.
pub fn channel(capacity: usize) -> (EventReporter, EventStream) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let dropped = Arc::new(AtomicU64::new(0));
    (
        EventReporter {
            tx,
            dropped: dropped.clone(),
        },
        EventStream { rx, dropped },
    )
}

impl EventReporter {
    pub fn error(&self, err: SyncError) {
        self.emit(SyncEvent::Error(err));
    }

    pub fn info(&self, table: Option<&str>, message: impl Into<String>) {
        self.emit(SyncEvent::Info {
            table: table.map(str::to_string),
            message: message.into(),
        });
    }

    /// Queue an event without waiting. A full buffer drops the event and
    /// logs it directly instead.
    pub fn emit(&self, event: SyncEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Event buffer full, dropping event: {:?}", event);
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                tracing::debug!("Event consumer gone, dropping event: {:?}", event);
            }
        }
    }

    /// Number of events dropped because the buffer was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl EventStream {
    pub async fn recv(&mut self) -> Option<SyncEvent> {
        self.rx.recv().await
    }

    /// Non-blocking receive, used by tests to drain what has been reported.
    pub fn try_recv(&mut self) -> Option<SyncEvent> {
        self.rx.try_recv().ok()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Consume events until every reporter is gone, logging each one.
    pub async fn log_all(mut self) {
        while let Some(event) = self.recv().await {
            log_event(&event);
        }
        let dropped = self.dropped();
        if dropped > 0 {
            tracing::warn!("{} events were dropped because the buffer was full", dropped);
        }
    }
}

fn log_event(event: &SyncEvent) {
    match (event, event.table()) {
        (SyncEvent::Error(err), table) if err.is_fatal() => {
            tracing::error!(table, fatal = true, "{}", err);
        }
        (SyncEvent::Error(err), table) => {
            tracing::error!(table, "{}", err);
        }
        (SyncEvent::Info { message, .. }, Some(table)) => {
            tracing::info!("[sync:{}] {}", table, message);
        }
        (SyncEvent::Info { message, .. }, None) => {
            tracing::info!("{}", message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_arrive_in_order() {
        let (reporter, mut stream) = channel(8);
        reporter.info(Some("users"), "syncing with id > 0");
        reporter.error(SyncError::Discovery {
            source: anyhow::anyhow!("boom"),
        });

        match stream.recv().await {
            Some(SyncEvent::Info { table, message }) => {
                assert_eq!(table.as_deref(), Some("users"));
                assert_eq!(message, "syncing with id > 0");
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(matches!(
            stream.recv().await,
            Some(SyncEvent::Error(SyncError::Discovery { .. }))
        ));
    }

    #[tokio::test]
    async fn test_full_buffer_drops_instead_of_blocking() {
        let (reporter, mut stream) = channel(2);
        for i in 0..5 {
            reporter.info(None, format!("event {}", i));
        }

        assert_eq!(reporter.dropped(), 3);
        assert_eq!(stream.dropped(), 3);
        assert!(stream.try_recv().is_some());
        assert!(stream.try_recv().is_some());
        assert!(stream.try_recv().is_none());
    }

    #[test]
    fn test_event_table_comes_from_error_or_info() {
        let schema = SyncEvent::Error(SyncError::Schema {
            table: "audit_log".to_string(),
            issue: crate::error::SchemaIssue::NoPrimaryKey,
        });
        assert_eq!(schema.table(), Some("audit_log"));

        let discovery = SyncEvent::Error(SyncError::Discovery {
            source: anyhow::anyhow!("permission denied"),
        });
        assert_eq!(discovery.table(), None);

        let info = SyncEvent::Info {
            table: Some("users".to_string()),
            message: "syncing with id from the beginning".to_string(),
        };
        assert_eq!(info.table(), Some("users"));
    }

    #[tokio::test]
    async fn test_log_all_ends_when_reporters_drop() {
        let (reporter, stream) = channel(4);
        reporter.info(None, "hello");
        drop(reporter);
        // Returns instead of hanging once the channel closes
        stream.log_all().await;
    }
}
