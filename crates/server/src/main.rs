// crates/server/src/main.rs
//! mediaq server binary.
//!
//! Loads configuration, starts the job service around the configured
//! executor command, serves the API and reaps finished jobs in the
//! background until Ctrl-C / SIGTERM.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use mediaq_core::{CommandExecutor, MediaqConfig};
use mediaq_server::{create_app, init_metrics, AppState};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "warn,mediaq_core=info,mediaq_server=info";

#[derive(Debug, Parser)]
#[command(name = "mediaq", version, about = "Media job queue with live progress streaming")]
struct Cli {
    /// TOML configuration file.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Listen port (overrides config and MEDIAQ_PORT).
    #[arg(short, long)]
    port: Option<u16>,

    /// Global concurrency limit, clamped to 1..=10.
    #[arg(long)]
    max_concurrent: Option<usize>,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .compact()
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let mut config = MediaqConfig::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(n) = cli.max_concurrent {
        config.scheduler.max_concurrent = n;
    }

    init_metrics();

    tokio::fs::create_dir_all(&config.storage.tmp_dir)
        .await
        .with_context(|| format!("creating {}", config.storage.tmp_dir.display()))?;

    let executor = Arc::new(CommandExecutor::from_config(&config.executor));
    let state = AppState::new(config.clone(), executor);

    let token = CancellationToken::new();
    let reap_interval = Duration::from_secs(config.storage.reap_interval_secs.max(1));
    let retention = Duration::from_secs(config.storage.retention_secs);
    let reaper = state.jobs.spawn_reaper(reap_interval, retention, token.clone());

    let prune_state = Arc::clone(&state);
    let prune_token = token.clone();
    let pruner = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(reap_interval);
        loop {
            tokio::select! {
                _ = prune_token.cancelled() => break,
                _ = ticker.tick() => {
                    let pruned = prune_state.batches.prune();
                    if pruned > 0 {
                        tracing::debug!(pruned, "Pruned finished batches");
                    }
                }
            }
        }
    });

    let app = create_app(Arc::clone(&state));
    let addr = SocketAddr::from(([127, 0, 0, 1], config.server.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;

    eprintln!("\n  mediaq v{}", env!("CARGO_PKG_VERSION"));
    eprintln!(
        "  executor: {}  max concurrent: {}  tmp: {}",
        config.executor.program,
        state.jobs.stats().max_concurrent,
        config.storage.tmp_dir.display()
    );
    eprintln!("  \u{2192} http://localhost:{}\n", config.server.port);
    tracing::info!(%addr, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    token.cancel();
    let _ = reaper.await;
    let _ = pruner.await;
    state.jobs.shutdown().await;
    Ok(())
}
