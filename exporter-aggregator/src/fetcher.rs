//! Scraping of a single upstream exporter.

use std::collections::HashMap;
use std::io;
use std::time::Duration;

use futures::TryStreamExt;
use tokio::io::{AsyncBufReadExt, AsyncReadExt};
use tokio_util::io::StreamReader;
use tracing::{debug, error, warn};

use crate::parser::{MetricIdentity, ParseError, Sample, SampleParser};

/// Longest exposition line accepted from an endpoint, newline excluded.
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Samples collected from one endpoint, keyed by identity.
pub type EndpointResult = HashMap<MetricIdentity, f64>;

/// Error type for endpoint scrapes.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("Could not do request for {endpoint}: {source}")]
    Unreachable {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Bad status code {status} for request {endpoint}")]
    BadStatus {
        endpoint: String,
        status: reqwest::StatusCode,
    },

    #[error("Error reading response from {endpoint}: {source}")]
    BodyRead {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    #[error("Line longer than {limit} bytes in response from {endpoint}")]
    LineTooLong { endpoint: String, limit: usize },
}

/// Performs bounded HTTP scrapes and parses the returned exposition text.
#[derive(Debug, Clone)]
pub struct EndpointFetcher {
    client: reqwest::Client,
    parser: SampleParser,
    timeout: Duration,
}

impl EndpointFetcher {
    /// Create a fetcher with its own HTTP client.
    pub fn new(parser: SampleParser, timeout: Duration) -> Self {
        Self::with_client(reqwest::Client::new(), parser, timeout)
    }

    /// Create a fetcher sharing an existing HTTP client.
    pub fn with_client(client: reqwest::Client, parser: SampleParser, timeout: Duration) -> Self {
        Self {
            client,
            parser,
            timeout,
        }
    }

    /// Timeout applied to each scrape, from connect until the body is read.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Scrape an endpoint, logging any failure.
    ///
    /// Returns an empty result if the endpoint could not be scraped.
    pub async fn collect(&self, endpoint: &str) -> EndpointResult {
        match self.fetch(endpoint).await {
            Ok(metrics) => metrics,
            Err(e) => {
                error!(endpoint, error = %e, "Endpoint scrape failed");
                EndpointResult::new()
            }
        }
    }

    /// Scrape an endpoint.
    ///
    /// Lines that fail to decode or parse are logged and skipped. A body that
    /// cannot be read to the end, or that contains a line longer than
    /// [`MAX_LINE_LENGTH`], fails the whole scrape.
    pub async fn fetch(&self, endpoint: &str) -> Result<EndpointResult, FetchError> {
        let response = self
            .client
            .get(endpoint)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|source| FetchError::Unreachable {
                endpoint: endpoint.to_string(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::BadStatus {
                endpoint: endpoint.to_string(),
                status,
            });
        }

        let body = Box::pin(response.bytes_stream().map_err(io::Error::other));
        let mut reader = StreamReader::new(body);
        let mut buf = Vec::new();
        let mut metrics = EndpointResult::new();
        let mut skipped = 0usize;

        loop {
            buf.clear();
            let read = (&mut reader)
                .take(MAX_LINE_LENGTH as u64 + 1)
                .read_until(b'\n', &mut buf)
                .await
                .map_err(|source| FetchError::BodyRead {
                    endpoint: endpoint.to_string(),
                    source,
                })?;
            if read == 0 {
                break;
            }

            let raw = buf.strip_suffix(b"\n").unwrap_or(&buf[..]);
            if raw.len() > MAX_LINE_LENGTH {
                return Err(FetchError::LineTooLong {
                    endpoint: endpoint.to_string(),
                    limit: MAX_LINE_LENGTH,
                });
            }

            match self.parse_line(raw, endpoint) {
                Ok(Some(sample)) => {
                    metrics.insert(sample.identity, sample.value);
                }
                Ok(None) => {}
                Err(e) => {
                    skipped += 1;
                    warn!(endpoint, error = %e, "Skipping unparseable metric line");
                }
            }
        }

        debug!(
            endpoint,
            samples = metrics.len(),
            skipped,
            "Endpoint scraped"
        );

        Ok(metrics)
    }

    /// Decode and parse one raw line. Blank and comment lines yield `None`.
    fn parse_line(&self, raw: &[u8], endpoint: &str) -> Result<Option<Sample>, ParseError> {
        let line = std::str::from_utf8(raw).map_err(|source| ParseError::Encoding {
            line: String::from_utf8_lossy(raw).into_owned(),
            source,
        })?;

        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(None);
        }

        self.parser.parse(line, endpoint).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_fetcher() -> EndpointFetcher {
        EndpointFetcher::new(SampleParser::default(), Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_invalid_url_is_unreachable() {
        let result = make_fetcher().fetch("not a url").await;
        assert!(matches!(result, Err(FetchError::Unreachable { .. })));
    }

    #[tokio::test]
    async fn test_connection_refused_is_unreachable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let endpoint = format!("http://{}/metrics", addr);
        let result = make_fetcher().fetch(&endpoint).await;
        assert!(matches!(result, Err(FetchError::Unreachable { .. })));
    }

    #[tokio::test]
    async fn test_collect_swallows_errors() {
        let metrics = make_fetcher().collect("not a url").await;
        assert!(metrics.is_empty());
    }

    #[test]
    fn test_parse_line_skips_comments_and_blanks() {
        let fetcher = make_fetcher();
        assert_eq!(fetcher.parse_line(b"", "http://a"), Ok(None));
        assert_eq!(fetcher.parse_line(b"  \r", "http://a"), Ok(None));
        assert_eq!(fetcher.parse_line(b"# TYPE foo counter", "http://a"), Ok(None));

        let sample = fetcher.parse_line(b"foo 2\r", "http://a").unwrap().unwrap();
        assert_eq!(sample.identity.as_str(), "foo");
        assert_eq!(sample.value, 2.0);
    }

    #[test]
    fn test_parse_line_rejects_invalid_utf8() {
        let err = make_fetcher()
            .parse_line(b"bar{x=\"caf\xe9\"} 2", "http://a")
            .unwrap_err();
        assert!(matches!(err, ParseError::Encoding { .. }));
        assert!(err.to_string().contains("bar{x="));
    }

    #[test]
    fn test_fetch_error_messages() {
        let err = FetchError::BadStatus {
            endpoint: "http://a".to_string(),
            status: reqwest::StatusCode::SERVICE_UNAVAILABLE,
        };
        assert_eq!(
            err.to_string(),
            "Bad status code 503 Service Unavailable for request http://a"
        );

        let err = FetchError::LineTooLong {
            endpoint: "http://a".to_string(),
            limit: MAX_LINE_LENGTH,
        };
        assert_eq!(
            err.to_string(),
            "Line longer than 65536 bytes in response from http://a"
        );
    }
}
