//! edgews Daemon
//!
//! Standalone WebSocket echo server on top of the edgews engine, with a
//! Prometheus endpoint and graceful shutdown on SIGINT/SIGTERM.

mod config;
mod handler;
mod metrics;

use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

use config::DaemonConfig;
use edgews_transport::Engine;
use handler::EchoHandler;

/// edgews Daemon - edge-triggered WebSocket server
#[derive(Parser, Debug)]
#[command(name = "edgewsd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "edgewsd.toml")]
    config: String,

    /// Extra configuration files merged on top, in order
    #[arg(long)]
    overlay: Vec<String>,

    /// Override the bind address
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Run in verbose mode
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("edgews Daemon v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let mut config = DaemonConfig::load(&args.config).await?;
    for overlay in &args.overlay {
        config.load_merge(overlay).await?;
        info!("Merged configuration from {}", overlay);
    }
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }

    let engine = Engine::start(config.server.bind, config.engine.clone(), Arc::new(EchoHandler))
        .await
        .inspect_err(|e| tracing::error!("Failed to start engine: {}", e))?;

    // Start metrics server
    let metrics_handle = metrics::start_server(&config.monitoring, engine.metrics());

    shutdown_signal().await;
    info!("Shutting down");

    engine.close().await;

    // Cleanup
    metrics_handle.abort();

    Ok(())
}

/// Resolve on SIGINT, or SIGTERM on unix
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
