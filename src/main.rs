// ABOUTME: CLI entry point for pg-mirror
// ABOUTME: Connects both databases, starts the mirror and runs until interrupted

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use pg_mirror::filters::TableFilter;
use pg_mirror::metrics::{serve as serve_metrics, MirrorMetrics};
use pg_mirror::mirror::{Mirror, MirrorConfig, PgReader, PgWriter};
use pg_mirror::postgres::{init_tls_policy, PgHandle};
use pg_mirror::utils::{validate_connection_string, validate_source_target_different};
use pg_mirror::SyncError;

#[derive(Parser)]
#[command(name = "pg-mirror")]
#[command(
    about = "Continuously copy new rows from one PostgreSQL database into another",
    long_about = None
)]
#[command(version)]
struct Cli {
    /// Source database URL
    #[arg(long, env = "PG_MIRROR_SOURCE")]
    source: String,
    /// Destination database URL
    #[arg(long, env = "PG_MIRROR_TARGET")]
    target: String,
    /// Mirror only these tables (comma-separated)
    #[arg(long, value_delimiter = ',')]
    include_tables: Option<Vec<String>>,
    /// Mirror every table except these (comma-separated)
    #[arg(long, value_delimiter = ',')]
    exclude_tables: Option<Vec<String>>,
    /// Source schema to mirror
    #[arg(long, default_value = "public")]
    schema: String,
    /// Seconds between ticks of each table
    #[arg(long, default_value_t = 60)]
    sync_interval: u64,
    /// Maximum rows copied per table per tick
    #[arg(long, default_value_t = 1000)]
    chunk_size: usize,
    /// Checkpoint file
    #[arg(long, default_value = ".pg-mirror/checkpoint.json")]
    state_path: PathBuf,
    /// Seconds between checkpoint flushes
    #[arg(long, default_value_t = 5)]
    persist_interval: u64,
    /// Back off exponentially after failed ticks, up to this many seconds
    #[arg(long)]
    max_backoff: Option<u64>,
    /// Serve Prometheus metrics on this address (e.g. 0.0.0.0:9090)
    #[arg(long)]
    metrics_addr: Option<SocketAddr>,
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log: String,
    /// Allow self-signed TLS certificates (insecure - use only for testing)
    #[arg(long = "allow-self-signed-certs", default_value_t = false)]
    allow_self_signed_certs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // RUST_LOG takes precedence over --log
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    init_tls_policy(cli.allow_self_signed_certs);

    validate_connection_string(&cli.source).context("Invalid --source")?;
    validate_connection_string(&cli.target).context("Invalid --target")?;
    validate_source_target_different(&cli.source, &cli.target)?;

    let filter = TableFilter::new(cli.include_tables, cli.exclude_tables)?;
    let config = MirrorConfig {
        sync_interval: Duration::from_secs(cli.sync_interval.max(1)),
        chunk_size: cli.chunk_size,
        state_path: cli.state_path,
        persist_interval: Duration::from_secs(cli.persist_interval.max(1)),
        schema: cli.schema.clone(),
        filter,
        max_backoff: cli.max_backoff.map(Duration::from_secs),
        ..MirrorConfig::default()
    };

    let source = connect(&cli.source).await?;
    let target = connect(&cli.target).await?;

    let mut mirror = Mirror::new(
        config,
        Arc::new(PgReader::new(source, cli.schema.clone())),
        Arc::new(PgWriter::new(target, cli.schema)),
    );

    let registry = match cli.metrics_addr {
        Some(_) => {
            let registry = Arc::new(MirrorMetrics::new()?);
            mirror = mirror.with_metrics(registry.clone());
            Some(registry)
        }
        None => None,
    };

    let (handle, events) = mirror.start().await;
    let event_logger = tokio::spawn(events.log_all());

    let metrics_server = match (cli.metrics_addr, registry) {
        (Some(addr), Some(registry)) => {
            let shutdown = handle.shutdown_token();
            Some(tokio::spawn(async move {
                if let Err(e) = serve_metrics(addr, registry, shutdown).await {
                    tracing::error!("{:#}", e);
                }
            }))
        }
        _ => None,
    };

    // a failed discovery has already been reported; stay up until told to stop
    handle
        .run_until(async {
            wait_for_shutdown_signal().await;
            tracing::info!("Received shutdown signal, exiting");
        })
        .await;

    if let Some(server) = metrics_server {
        let _ = server.await;
    }
    // every reporter is gone once the tasks are joined, so the logger drains and ends
    let _ = event_logger.await;

    Ok(())
}

async fn connect(url: &str) -> anyhow::Result<Arc<PgHandle>> {
    let handle = PgHandle::connect(url)
        .await
        .map_err(|source| SyncError::Connection {
            endpoint: pg_mirror::utils::sanitize_url(url),
            source,
        })?;
    tracing::info!("Connected to {}", handle.endpoint());
    Ok(Arc::new(handle))
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!("Failed to listen for SIGTERM: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
