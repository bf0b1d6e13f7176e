// ABOUTME: Prometheus metrics for table mirroring and their HTTP exposition
// ABOUTME: Per-table last-sync gauge plus row and failure counters

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, GaugeVec, IntCounterVec, Opts, Registry, TextEncoder};
use tokio_util::sync::CancellationToken;

/// Metrics registry owned by one mirror instance.
pub struct MirrorMetrics {
    registry: Registry,
    last_table_sync: GaugeVec,
    rows_mirrored: IntCounterVec,
    insert_errors: IntCounterVec,
}

impl MirrorMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let last_table_sync = GaugeVec::new(
            Opts::new(
                "pg_mirror_last_table_sync_timestamp_seconds",
                "Timestamp of the last successful table sync.",
            ),
            &["table_name"],
        )?;
        let rows_mirrored = IntCounterVec::new(
            Opts::new(
                "pg_mirror_rows_mirrored_total",
                "Rows written to the destination.",
            ),
            &["table_name"],
        )?;
        let insert_errors = IntCounterVec::new(
            Opts::new(
                "pg_mirror_insert_errors_total",
                "Rows that failed to insert into the destination.",
            ),
            &["table_name"],
        )?;

        registry.register(Box::new(last_table_sync.clone()))?;
        registry.register(Box::new(rows_mirrored.clone()))?;
        registry.register(Box::new(insert_errors.clone()))?;

        Ok(Self {
            registry,
            last_table_sync,
            rows_mirrored,
            insert_errors,
        })
    }

    /// Record a tick whose fetch succeeded.
    pub fn record_tick(&self, table: &str, inserted: u64, failed: u64) {
        self.last_table_sync
            .with_label_values(&[table])
            .set(chrono::Utc::now().timestamp() as f64);
        if inserted > 0 {
            self.rows_mirrored.with_label_values(&[table]).inc_by(inserted);
        }
        if failed > 0 {
            self.insert_errors.with_label_values(&[table]).inc_by(failed);
        }
    }

    pub fn last_sync_timestamp(&self, table: &str) -> f64 {
        self.last_table_sync.with_label_values(&[table]).get()
    }

    pub fn rows_mirrored(&self, table: &str) -> u64 {
        self.rows_mirrored.with_label_values(&[table]).get()
    }

    pub fn insert_errors(&self, table: &str) -> u64 {
        self.insert_errors.with_label_values(&[table]).get()
    }

    /// Prometheus text exposition of every metric.
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .context("Failed to encode metrics")?;
        String::from_utf8(buffer).context("Metrics output is not UTF-8")
    }
}

/// `/metrics` serves the registry; `/` redirects there.
pub fn router(metrics: Arc<MirrorMetrics>) -> Router {
    Router::new()
        .route("/", get(redirect_to_metrics))
        .route("/metrics", get(metrics_handler))
        .with_state(metrics)
}

async fn redirect_to_metrics() -> Response {
    (StatusCode::FOUND, [(header::LOCATION, "/metrics")]).into_response()
}

async fn metrics_handler(State(metrics): State<Arc<MirrorMetrics>>) -> Response {
    match metrics.render() {
        Ok(body) => (
            [(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!("Failed to render metrics: {:#}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Serve metrics on `addr` until `shutdown` is cancelled.
pub async fn serve(
    addr: SocketAddr,
    metrics: Arc<MirrorMetrics>,
    shutdown: CancellationToken,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind metrics listener on {}", addr))?;
    tracing::info!("Serving metrics on http://{}/metrics", addr);

    axum::serve(listener, router(metrics))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("Metrics server failed")?;
    Ok(())
}
