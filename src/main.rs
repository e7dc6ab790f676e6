//! crauti gateway binary.
//!
//! # Architecture Overview
//!
//! ```text
//!     crauti.toml ──▶ config ──▶ Gateway::update ──▶ Generation ──▶ Server (HTTP / HTTPS)
//!          ▲                          │                                  │
//!          │                          ▼                                  ▼
//!     notify watcher            MetricsRegistry ──▶ GET /metrics   Router ──▶ pipeline ──▶ upstream
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;

use crauti::cache::MemoryStore;
use crauti::config::{load_config, resolve_mount_points, ConfigWatcher};
use crauti::lifecycle::{shutdown_on_signal, Shutdown};
use crauti::observability::{init_logging, serve_metrics, MetricsRegistry};
use crauti::{Gateway, GatewaySettings, Server, ServerConfig};

#[derive(Debug, Parser)]
#[command(name = "crauti", version, about = "HTTP(S) reverse-proxy gateway")]
struct Args {
    /// Configuration file.
    #[arg(short, long, default_value = "crauti.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = load_config(&args.config)?;
    init_logging(
        &config.observability.log_level,
        &config.observability.log_format,
    )?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %args.config.display(),
        listen_address = %config.listen_address,
        mount_points = config.mount_points.len(),
        "crauti starting"
    );

    let shutdown = Shutdown::new();
    let metrics = Arc::new(MetricsRegistry::new()?);
    let gateway = Gateway::new(
        GatewaySettings::from(&config),
        Arc::new(MemoryStore::new()),
        metrics.clone(),
    )?;

    let server = Server::new(
        ServerConfig::from_config(&config)?,
        gateway.subscribe(),
        shutdown.subscribe(),
    );
    let server_task = tokio::spawn(server.run());

    let metrics_task = if config.observability.metrics_enabled {
        let listener = TcpListener::bind(&config.observability.metrics_address).await?;
        Some(tokio::spawn(serve_metrics(
            listener,
            metrics,
            shutdown.subscribe(),
        )))
    } else {
        None
    };

    gateway.update(resolve_mount_points(&config))?;

    // Keep the watcher alive for the lifetime of the process.
    let (watcher, mut reloads) = ConfigWatcher::new(&args.config);
    let _watcher = match watcher.run() {
        Ok(watcher) => Some(watcher),
        Err(e) => {
            tracing::warn!(error = %e, "Config watcher unavailable, hot reload disabled");
            None
        }
    };

    tokio::spawn(shutdown_on_signal(shutdown.clone()));

    let mut stopping = shutdown.subscribe();
    loop {
        tokio::select! {
            _ = stopping.recv() => break,
            Some(new_config) = reloads.recv() => {
                if let Err(e) = gateway.update(resolve_mount_points(&new_config)) {
                    tracing::error!(error = %e, "Reconfiguration rejected, keeping current routing");
                }
            }
        }
    }

    server_task.await?;
    if let Some(task) = metrics_task {
        if let Err(e) = task.await? {
            tracing::error!(error = %e, "Metrics endpoint failed");
        }
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
