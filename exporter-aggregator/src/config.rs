//! Configuration for the exporter aggregator.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::parser::{DEFAULT_ENDPOINT_LABEL, DEFAULT_SELF_HEALTH_PREFIXES};

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] json5::Error),
    #[error("Failed to parse YAML config: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Complete aggregator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatorConfig {
    /// Exporter URLs scraped on every request.
    #[serde(default)]
    pub endpoints: Vec<String>,

    /// Timeout for a single endpoint scrape, e.g. "10s" or "1500ms".
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// Maximum number of endpoints scraped at once (0 = no limit).
    #[serde(default)]
    pub max_concurrency: usize,

    /// HTTP listener settings.
    #[serde(default)]
    pub web: WebConfig,

    /// Self-health metric classification.
    #[serde(default)]
    pub classification: ClassificationConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    /// Address to listen on (default: "0.0.0.0:9299").
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Path for the aggregated metrics (default: "/metrics").
    #[serde(default = "default_path")]
    pub path: String,
}

fn default_listen() -> String {
    "0.0.0.0:9299".to_string()
}

fn default_path() -> String {
    "/metrics".to_string()
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            path: default_path(),
        }
    }
}

/// Which metrics describe an exporter itself and must keep one series per
/// endpoint instead of being summed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationConfig {
    /// Metric name prefixes treated as self-health metrics.
    #[serde(default = "default_self_health_prefixes")]
    pub self_health_prefixes: Vec<String>,

    /// Label added to self-health metrics, holding the endpoint URL.
    #[serde(default = "default_endpoint_label")]
    pub endpoint_label: String,
}

fn default_self_health_prefixes() -> Vec<String> {
    DEFAULT_SELF_HEALTH_PREFIXES
        .iter()
        .map(|p| p.to_string())
        .collect()
}

fn default_endpoint_label() -> String {
    DEFAULT_ENDPOINT_LABEL.to_string()
}

impl Default for ClassificationConfig {
    fn default() -> Self {
        Self {
            self_health_prefixes: default_self_health_prefixes(),
            endpoint_label: default_endpoint_label(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log output format: "text" or "json".
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl AggregatorConfig {
    /// Load configuration from a file.
    ///
    /// Files ending in `.yaml` or `.yml` are read as YAML, anything else as
    /// JSON5.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;

        let is_yaml = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml"));

        if is_yaml {
            Self::parse_yaml(&content)
        } else {
            Self::parse(&content)
        }
    }

    /// Parse configuration from a JSON5 string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: AggregatorConfig = json5::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string.
    pub fn parse_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: AggregatorConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoints.is_empty() {
            return Err(ConfigError::Validation(
                "no endpoints specified".to_string(),
            ));
        }

        for endpoint in &self.endpoints {
            let url = url::Url::parse(endpoint).map_err(|e| {
                ConfigError::Validation(format!("Invalid endpoint {}: {}", endpoint, e))
            })?;
            if url.scheme() != "http" && url.scheme() != "https" {
                return Err(ConfigError::Validation(format!(
                    "Endpoint {} must use http or https",
                    endpoint
                )));
            }
        }

        if self.timeout.is_zero() {
            return Err(ConfigError::Validation(
                "timeout must be > 0".to_string(),
            ));
        }

        // Validate listen address format
        if self.web.listen.parse::<std::net::SocketAddr>().is_err() {
            return Err(ConfigError::Validation(format!(
                "Invalid listen address: {}",
                self.web.listen
            )));
        }

        // Validate path starts with /
        if !self.web.path.starts_with('/') {
            return Err(ConfigError::Validation(
                "Metrics path must start with /".to_string(),
            ));
        }

        if self.web.path == "/health" {
            return Err(ConfigError::Validation(
                "Metrics path must not be /health".to_string(),
            ));
        }

        if !is_valid_label_name(&self.classification.endpoint_label) {
            return Err(ConfigError::Validation(format!(
                "Invalid endpoint label name: {}",
                self.classification.endpoint_label
            )));
        }

        if self
            .classification
            .self_health_prefixes
            .iter()
            .any(|p| p.is_empty())
        {
            return Err(ConfigError::Validation(
                "Self-health prefixes must not be empty".to_string(),
            ));
        }

        Ok(())
    }
}

/// Label names must match `[a-zA-Z_][a-zA-Z0-9_]*` and must not use the
/// reserved `__` prefix.
fn is_valid_label_name(name: &str) -> bool {
    let mut chars = name.chars();
    let valid_first = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');

    valid_first
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with("__")
}
