//! Aggregating proxy for Prometheus exporters.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};

use exporter_aggregator::{Aggregator, AggregatorConfig, HttpServer, init_tracing};

/// Aggregating proxy for Prometheus exporters.
#[derive(Parser, Debug)]
#[command(name = "exporter-aggregator")]
#[command(about = "Sum the metrics of many Prometheus exporters into one scrape target")]
#[command(version)]
struct Args {
    /// Path to configuration file (JSON5 or YAML).
    #[arg(short, long)]
    config: PathBuf,

    /// HTTP listen address (overrides config).
    #[arg(long)]
    listen: Option<String>,

    /// Path under which to expose metrics (overrides config).
    #[arg(long)]
    path: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = AggregatorConfig::load_from_file(&args.config)?;

    // Override listener settings from CLI
    if let Some(listen) = args.listen {
        config.web.listen = listen;
    }
    if let Some(path) = args.path {
        config.web.path = path;
    }
    config.validate()?;

    init_tracing(&config.logging, args.log_level.as_deref())?;

    info!(
        endpoints = config.endpoints.len(),
        timeout = ?config.timeout,
        max_concurrency = config.max_concurrency,
        "Starting exporter aggregator"
    );

    let listen_addr: SocketAddr = config
        .web
        .listen
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid listen address: {}", e))?;

    let aggregator = Arc::new(Aggregator::from_config(&config));
    let http_server = HttpServer::new(aggregator, listen_addr, config.web.path.clone());

    // Create shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut http_task = tokio::spawn(async move { http_server.run(shutdown_rx).await });

    // Wait for shutdown signal, or for the server to fail on its own
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
        _ = terminate() => {
            info!("Received SIGTERM, shutting down...");
        }
        result = &mut http_task => {
            return match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => {
                    error!("HTTP server error: {}", e);
                    Err(e)
                }
                Err(e) => Err(e.into()),
            };
        }
    }

    // Signal shutdown
    shutdown_tx.send(true)?;

    // In-flight scrapes finish within the endpoint timeout
    let grace = config.timeout + Duration::from_secs(1);
    if tokio::time::timeout(grace, http_task).await.is_err() {
        error!("HTTP server did not stop in time");
    }

    info!("Exporter aggregator stopped");
    Ok(())
}

async fn terminate() {
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        std::future::pending::<()>().await;
    }
}
