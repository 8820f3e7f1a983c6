//! Parsing of exposition text lines into samples.
//!
//! A line has the shape `IDENTITY VALUE`, where the identity is either a bare
//! metric name or a name followed by a label set (`name{label="value",...}`).
//! Label values are allowed to contain whitespace, so the identity token ends
//! at the closing brace of the label set rather than at the first space.

use std::borrow::Borrow;
use std::fmt;

use thiserror::Error;

use crate::exposition::escape_label_value;

/// Metric name prefixes describing an exporter's own runtime rather than
/// domain data.
pub const DEFAULT_SELF_HEALTH_PREFIXES: &[&str] = &["go_", "process_", "http_"];

/// Label used to tell self-health series from different endpoints apart.
pub const DEFAULT_ENDPOINT_LABEL: &str = "endpoint";

/// Errors produced while parsing a single exposition line.
#[derive(Debug, Error, PartialEq)]
pub enum ParseError {
    #[error("Malformed metric line {line:?}: {reason}")]
    Malformed { line: String, reason: &'static str },

    #[error("Unable to convert metric to float in line {line:?}: {source}")]
    Value {
        line: String,
        #[source]
        source: std::num::ParseFloatError,
    },

    #[error("Metric line {line:?} is not valid UTF-8: {source}")]
    Encoding {
        line: String,
        #[source]
        source: std::str::Utf8Error,
    },
}

/// The key identifying a metric series: name plus rendered label set.
///
/// Identities are compared byte for byte, so `a{x="1",y="2"}` and
/// `a{y="2",x="1"}` are different series.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MetricIdentity(String);

impl MetricIdentity {
    /// The rendered identity.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MetricIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for MetricIdentity {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for MetricIdentity {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for MetricIdentity {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A single parsed sample.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub identity: MetricIdentity,
    pub value: f64,
}

/// Turns exposition lines into samples, relabeling self-health metrics with
/// the endpoint they were scraped from.
#[derive(Debug, Clone)]
pub struct SampleParser {
    self_health_prefixes: Vec<String>,
    endpoint_label: String,
}

impl SampleParser {
    /// Create a parser with a custom self-health classification.
    pub fn new(self_health_prefixes: Vec<String>, endpoint_label: impl Into<String>) -> Self {
        Self {
            self_health_prefixes,
            endpoint_label: endpoint_label.into(),
        }
    }

    /// Parse one metric line scraped from `endpoint`.
    ///
    /// Comment lines must be filtered out by the caller.
    pub fn parse(&self, line: &str, endpoint: &str) -> Result<Sample, ParseError> {
        let (identity, value) = split_line(line).map_err(|reason| ParseError::Malformed {
            line: line.to_string(),
            reason,
        })?;

        let value = value.parse::<f64>().map_err(|source| ParseError::Value {
            line: line.to_string(),
            source,
        })?;

        let identity = if self.is_self_health(base_name(identity)) {
            self.with_endpoint_label(identity, endpoint)
        } else {
            identity.to_string()
        };

        Ok(Sample {
            identity: MetricIdentity(identity),
            value,
        })
    }

    /// Whether a metric name belongs to an exporter's own runtime metrics.
    pub fn is_self_health(&self, name: &str) -> bool {
        self.self_health_prefixes
            .iter()
            .any(|prefix| name.starts_with(prefix.as_str()))
    }

    /// Append the endpoint label. A label of the same name already on the
    /// series is kept as `exported_<name>`.
    fn with_endpoint_label(&self, identity: &str, endpoint: &str) -> String {
        let identity = rename_label(identity, &self.endpoint_label);
        let identity = identity.as_str();
        let label = format!(
            "{}=\"{}\"",
            self.endpoint_label,
            escape_label_value(endpoint)
        );

        match identity.strip_suffix('}') {
            // `name{}` or `name{a="1",}`
            Some(head) if head.ends_with('{') || head.ends_with(',') => {
                format!("{}{}}}", head, label)
            }
            Some(head) => format!("{},{}}}", head, label),
            None => format!("{}{{{}}}", identity, label),
        }
    }
}

impl Default for SampleParser {
    fn default() -> Self {
        Self::new(
            DEFAULT_SELF_HEALTH_PREFIXES
                .iter()
                .map(|p| p.to_string())
                .collect(),
            DEFAULT_ENDPOINT_LABEL,
        )
    }
}

fn base_name(identity: &str) -> &str {
    identity.split('{').next().unwrap_or(identity)
}

/// Prefix `exported_` to every label called `name` in the identity's label set.
fn rename_label(identity: &str, name: &str) -> String {
    let mut renamed = identity.to_string();
    for start in label_name_offsets(identity).into_iter().rev() {
        let rest = &identity[start..];
        let is_match = rest
            .strip_prefix(name)
            .is_some_and(|after| after.trim_start().starts_with('='));
        if is_match {
            renamed.insert_str(start, "exported_");
        }
    }
    renamed
}

/// Byte offsets where label names start inside a label set.
fn label_name_offsets(identity: &str) -> Vec<usize> {
    let bytes = identity.as_bytes();
    let Some(open) = identity.find('{') else {
        return Vec::new();
    };

    let mut offsets = Vec::new();
    let mut expecting_name = true;
    let mut in_quotes = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate().skip(open + 1) {
        if in_quotes {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_quotes = false;
            }
        } else if b == b'"' {
            in_quotes = true;
        } else if b == b',' {
            expecting_name = true;
        } else if b == b'}' {
            break;
        } else if expecting_name && !b.is_ascii_whitespace() {
            offsets.push(i);
            expecting_name = false;
        }
    }

    offsets
}

/// Split a line into its identity and value tokens.
fn split_line(line: &str) -> Result<(&str, &str), &'static str> {
    let line = line.trim();
    let end = identity_end(line)?;
    let (identity, rest) = line.split_at(end);

    if rest.is_empty() {
        return Err("missing value");
    }
    if !rest.starts_with(char::is_whitespace) {
        return Err("unexpected characters after label set");
    }

    let mut tokens = rest.split_whitespace();
    let value = tokens.next().ok_or("missing value")?;
    if tokens.next().is_some() {
        return Err("expected exactly two fields");
    }

    Ok((identity, value))
}

/// Byte offset just past the identity token.
fn identity_end(line: &str) -> Result<usize, &'static str> {
    let bytes = line.as_bytes();
    let mut i = 0;

    while i < bytes.len() && !bytes[i].is_ascii_whitespace() && bytes[i] != b'{' {
        i += 1;
    }
    if i == 0 {
        return Err("missing metric name");
    }
    if i == bytes.len() || bytes[i] != b'{' {
        return Ok(i);
    }

    let mut in_quotes = false;
    let mut escaped = false;
    i += 1;

    while i < bytes.len() {
        let b = bytes[i];
        if in_quotes {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_quotes = false;
            }
        } else if b == b'"' {
            in_quotes = true;
        } else if b == b'}' {
            return Ok(i + 1);
        }
        i += 1;
    }

    Err("unterminated label set")
}
