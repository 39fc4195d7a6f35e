//! Framehouse Storage Daemon
//!
//! Recovers the stored rates, serves Prometheus metrics, and optionally runs
//! a synthetic camera feed into storage.
//!
//! ## Configuration
//! Settings come from an optional JSON file (`--config`), then flags, each
//! of which also reads an environment variable:
//!
//! - `FRAMEHOUSE_CONFIG`: JSON config file (storage settings and archive tiers)
//! - `FRAMEHOUSE_ROOT_DIR`: local chunk directory (overrides the file)
//! - `FRAMEHOUSE_MAX_COST_PER_MONTH`: monthly storage budget (overrides the file)
//! - `FRAMEHOUSE_METRICS_ADDR`: metrics bind address (default: 0.0.0.0:9100)
//! - `FRAMEHOUSE_SYNTHETIC_FPS`: run the synthetic camera at this frame rate
//!
//! ## Example Usage
//! ```bash
//! # Local disk only, fake camera at 30fps
//! cargo run -p framehouse-server -- --root-dir ./data --synthetic-fps 30
//!
//! # With archive tiers from a config file
//! RUST_LOG=framehouse_storage=debug cargo run -p framehouse-server -- --config framehouse.json
//! ```

use anyhow::Result;
use axum::Router;
use clap::Parser;
use framehouse_server::{ServerConfig, SyntheticCamera};
use framehouse_storage::StorageManager;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Parser)]
#[command(name = "framehouse")]
#[command(about = "Tiered storage for a live camera's video frames", long_about = None)]
struct Cli {
    /// JSON configuration file
    #[arg(short, long, env = "FRAMEHOUSE_CONFIG")]
    config: Option<PathBuf>,

    /// Local chunk directory
    #[arg(long, env = "FRAMEHOUSE_ROOT_DIR")]
    root_dir: Option<PathBuf>,

    /// Monthly storage budget across every rate and tier
    #[arg(long, env = "FRAMEHOUSE_MAX_COST_PER_MONTH")]
    max_cost_per_month: Option<f64>,

    /// Metrics bind address
    #[arg(long, env = "FRAMEHOUSE_METRICS_ADDR", default_value = "0.0.0.0:9100")]
    metrics_addr: SocketAddr,

    /// Drive a synthetic camera feed at this many frames per second
    #[arg(long, env = "FRAMEHOUSE_SYNTHETIC_FPS")]
    synthetic_fps: Option<f64>,
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown");
        },
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = ServerConfig::load(cli.config.as_deref())?;
    if let Some(root_dir) = cli.root_dir {
        config.storage.root_dir = root_dir;
    }
    if let Some(cost) = cli.max_cost_per_month {
        config.storage.max_cost_per_month = cost;
    }

    framehouse_observability::init();

    let mut manager = StorageManager::new(config.storage.clone())?;
    for archive in &config.archives {
        tracing::info!(
            prefix = %archive.prefix,
            class = %archive.class,
            "Adding archive tier"
        );
        manager = manager.with_remote_tier(Arc::new(archive.factory()?));
    }
    let manager = Arc::new(manager.recover().await?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Metrics endpoint
    let app = Router::new().merge(framehouse_observability::exporter::create_metrics_router());
    let listener = tokio::net::TcpListener::bind(cli.metrics_addr).await?;
    let mut http_shutdown = shutdown_rx.clone();
    let http_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = http_shutdown.wait_for(|stop| *stop).await;
            })
            .await
    });

    let feed_handle = match cli.synthetic_fps {
        Some(fps) => {
            let camera = SyntheticCamera::new(config.storage.base_rate, manager.get_next_add_seq_num().await)?;
            Some(tokio::spawn(camera.run(manager.clone(), fps, shutdown_rx.clone())))
        }
        None => None,
    };

    tracing::info!(
        root_dir = %config.storage.root_dir.display(),
        archives = config.archives.len(),
        metrics = %cli.metrics_addr,
        synthetic_fps = ?cli.synthetic_fps,
        "Framehouse started"
    );

    shutdown_signal().await;
    let _ = shutdown_tx.send(true);

    if let Some(feed) = feed_handle {
        match feed.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!(error = %e, "Synthetic camera failed"),
            Err(e) => tracing::error!(error = %e, "Synthetic camera task panicked"),
        }
    }

    tracing::info!("Flushing storage...");
    if let Err(e) = manager.shutdown().await {
        tracing::error!(error = %e, "Error during storage shutdown");
    }

    http_handle.await??;
    tracing::info!("Framehouse shut down gracefully");
    Ok(())
}
