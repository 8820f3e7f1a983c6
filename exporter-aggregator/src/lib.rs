//! Aggregating proxy for Prometheus exporters.
//!
//! Every scrape of the `/metrics` endpoint fans out to all configured
//! exporters, parses their text exposition and sums series that share an
//! identity, so one scrape target can stand in for a fleet.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐     ┌─────────────────┐
//! │   Exporters     │────>│   Aggregator    │────>│   HTTP Server   │
//! │ (N endpoints)   │     │ (fetch + merge) │     │   (/metrics)    │
//! └─────────────────┘     └─────────────────┘     └─────────────────┘
//! ```
//!
//! Self-health metrics (`go_*`, `process_*`, `http_*` by default) are not
//! summed; each one gets an `endpoint` label so every exporter keeps its own
//! series.
//!
//! # Usage
//!
//! ```bash
//! exporter-aggregator --config config.json5
//! ```
//!
//! # Configuration
//!
//! See [`config::AggregatorConfig`] for configuration options.

pub mod aggregator;
pub mod config;
pub mod exposition;
pub mod fetcher;
pub mod http;
pub mod parser;

pub use aggregator::{AggregatedResult, Aggregator, SharedAggregator};
pub use config::{AggregatorConfig, ConfigError, LogFormat, LoggingConfig};
pub use fetcher::{EndpointFetcher, EndpointResult, FetchError};
pub use http::HttpServer;
pub use parser::{MetricIdentity, ParseError, Sample, SampleParser};

/// Initialize tracing.
///
/// `RUST_LOG` takes precedence, then `level_override`, then the configured
/// level.
pub fn init_tracing(config: &LoggingConfig, level_override: Option<&str>) -> anyhow::Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let level = level_override.unwrap_or(&config.level);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match config.format {
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(fmt::layer())
                .with(filter)
                .try_init()
                .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {}", e))?;
        }
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(fmt::layer().json())
                .with(filter)
                .try_init()
                .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {}", e))?;
        }
    }

    Ok(())
}
