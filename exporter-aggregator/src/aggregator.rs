//! Fan-out of scrapes across endpoints and merge of their results.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{Semaphore, mpsc};
use tracing::{debug, trace};

use crate::config::AggregatorConfig;
use crate::exposition;
use crate::fetcher::{EndpointFetcher, EndpointResult};
use crate::parser::{MetricIdentity, SampleParser};

/// Metrics summed across every endpoint that returned samples.
#[derive(Debug, Clone, Default)]
pub struct AggregatedResult {
    metrics: HashMap<MetricIdentity, f64>,
    successful_endpoints: usize,
}

impl AggregatedResult {
    /// Add one endpoint's samples into the running sums.
    ///
    /// Empty results are ignored and do not count as successful.
    pub fn merge(&mut self, result: EndpointResult) {
        if result.is_empty() {
            return;
        }

        for (identity, value) in result {
            self.metrics
                .entry(identity)
                .and_modify(|sum| *sum += value)
                .or_insert(value);
        }
        self.successful_endpoints += 1;
    }

    /// Summed value for an identity.
    pub fn get(&self, identity: &str) -> Option<f64> {
        self.metrics.get(identity).copied()
    }

    pub fn metrics(&self) -> &HashMap<MetricIdentity, f64> {
        &self.metrics
    }

    /// Number of endpoints that contributed at least one sample.
    pub fn successful_endpoints(&self) -> usize {
        self.successful_endpoints
    }

    /// Number of distinct series.
    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    /// Render in the text exposition format.
    pub fn render(&self) -> String {
        exposition::render(self)
    }
}

impl FromIterator<EndpointResult> for AggregatedResult {
    fn from_iter<I: IntoIterator<Item = EndpointResult>>(iter: I) -> Self {
        let mut result = Self::default();
        for endpoint_result in iter {
            result.merge(endpoint_result);
        }
        result
    }
}

/// Scrapes all configured endpoints concurrently and merges the results.
pub struct Aggregator {
    endpoints: Vec<String>,
    fetcher: Arc<EndpointFetcher>,
    max_concurrency: usize,
}

impl Aggregator {
    /// Create an aggregator.
    ///
    /// `max_concurrency` bounds the number of scrapes in flight; `0` allows
    /// one per endpoint.
    pub fn new(endpoints: Vec<String>, fetcher: EndpointFetcher, max_concurrency: usize) -> Self {
        Self {
            endpoints,
            fetcher: Arc::new(fetcher),
            max_concurrency,
        }
    }

    /// Create an aggregator from a validated configuration.
    pub fn from_config(config: &AggregatorConfig) -> Self {
        let parser = SampleParser::new(
            config.classification.self_health_prefixes.clone(),
            config.classification.endpoint_label.clone(),
        );
        let fetcher = EndpointFetcher::new(parser, config.timeout);

        Self::new(config.endpoints.clone(), fetcher, config.max_concurrency)
    }

    /// Configured endpoint URLs, in configuration order.
    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    fn permits(&self) -> usize {
        let permits = match self.max_concurrency {
            0 => self.endpoints.len(),
            n => n.min(self.endpoints.len()),
        };
        permits.max(1)
    }

    /// Scrape every endpoint and merge what they return.
    ///
    /// Completes once every scrape has either finished or hit its timeout.
    pub async fn run(&self) -> AggregatedResult {
        let started = Instant::now();
        let semaphore = Arc::new(Semaphore::new(self.permits()));
        let (tx, mut rx) = mpsc::channel::<EndpointResult>(self.endpoints.len().max(1));

        for endpoint in &self.endpoints {
            let tx = tx.clone();
            let fetcher = self.fetcher.clone();
            let semaphore = semaphore.clone();
            let endpoint = endpoint.clone();

            tokio::spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return;
                };

                let metrics = fetcher.collect(&endpoint).await;
                if metrics.is_empty() {
                    trace!(endpoint = %endpoint, "Endpoint returned no samples");
                    return;
                }

                // Receiver outlives every sender
                let _ = tx.send(metrics).await;
            });
        }

        // The channel closes once the last task drops its sender
        drop(tx);

        let mut result = AggregatedResult::default();
        while let Some(metrics) = rx.recv().await {
            result.merge(metrics);
        }

        debug!(
            endpoints = self.endpoints.len(),
            successful = result.successful_endpoints(),
            series = result.len(),
            timeout_ms = self.fetcher.timeout().as_millis() as u64,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Aggregation complete"
        );

        result
    }
}

/// Create a shareable aggregator handle.
pub type SharedAggregator = Arc<Aggregator>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn endpoint_result(pairs: &[(&str, f64)]) -> EndpointResult {
        pairs
            .iter()
            .map(|(id, v)| (MetricIdentity::from(*id), *v))
            .collect()
    }

    fn permutations<T: Clone>(items: &[T]) -> Vec<Vec<T>> {
        if items.len() <= 1 {
            return vec![items.to_vec()];
        }

        let mut out = Vec::new();
        for i in 0..items.len() {
            let mut rest = items.to_vec();
            let head = rest.remove(i);
            for mut tail in permutations(&rest) {
                tail.insert(0, head.clone());
                out.push(tail);
            }
        }
        out
    }

    #[test]
    fn test_merge_sums_shared_identities() {
        let result: AggregatedResult = vec![
            endpoint_result(&[("requests_total", 5.0)]),
            endpoint_result(&[("requests_total", 7.0)]),
        ]
        .into_iter()
        .collect();

        assert_eq!(result.get("requests_total"), Some(12.0));
        assert_eq!(result.successful_endpoints(), 2);
    }

    #[test]
    fn test_merge_keeps_disjoint_identities() {
        let result: AggregatedResult = vec![
            endpoint_result(&[("foo", 1.0), (r#"bar{x="1"}"#, 2.0)]),
            endpoint_result(&[("foo", 3.0)]),
        ]
        .into_iter()
        .collect();

        assert_eq!(result.get("foo"), Some(4.0));
        assert_eq!(result.get(r#"bar{x="1"}"#), Some(2.0));
        assert_eq!(result.get("baz"), None);
        assert_eq!(result.len(), 2);
    }

    #[test]
    fn test_empty_results_are_not_counted() {
        let result: AggregatedResult = vec![
            endpoint_result(&[("foo", 1.0)]),
            EndpointResult::new(),
            EndpointResult::new(),
        ]
        .into_iter()
        .collect();

        assert_eq!(result.successful_endpoints(), 1);
        assert_eq!(result.get("foo"), Some(1.0));
    }

    #[test]
    fn test_merge_is_order_independent() {
        // Values chosen so every partial sum is exact in f64
        let inputs = vec![
            endpoint_result(&[("a", 1.0), ("b", 0.5)]),
            endpoint_result(&[("a", 2.0), ("c", 4.0)]),
            endpoint_result(&[("b", 0.25), ("c", 8.0), ("d", -1.0)]),
            EndpointResult::new(),
        ];

        let expected: AggregatedResult = inputs.clone().into_iter().collect();
        assert_eq!(expected.get("a"), Some(3.0));
        assert_eq!(expected.get("b"), Some(0.75));
        assert_eq!(expected.get("c"), Some(12.0));
        assert_eq!(expected.get("d"), Some(-1.0));
        assert_eq!(expected.successful_endpoints(), 3);

        for ordering in permutations(&inputs) {
            let result: AggregatedResult = ordering.into_iter().collect();
            assert_eq!(result.metrics(), expected.metrics());
            assert_eq!(result.successful_endpoints(), 3);
        }
    }

    #[test]
    fn test_permits() {
        let endpoints = vec!["http://a".to_string(), "http://b".to_string()];
        let fetcher = EndpointFetcher::new(SampleParser::default(), Duration::from_secs(1));

        let unbounded = Aggregator::new(endpoints.clone(), fetcher.clone(), 0);
        assert_eq!(unbounded.permits(), 2);
        assert_eq!(unbounded.endpoints(), &endpoints[..]);

        let bounded = Aggregator::new(endpoints.clone(), fetcher.clone(), 1);
        assert_eq!(bounded.permits(), 1);

        let oversized = Aggregator::new(endpoints, fetcher.clone(), 10);
        assert_eq!(oversized.permits(), 2);

        let empty = Aggregator::new(Vec::new(), fetcher, 0);
        assert_eq!(empty.permits(), 1);
    }

    #[tokio::test]
    async fn test_run_with_unreachable_endpoints() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let endpoints = vec![format!("http://{}/metrics", addr), "not a url".to_string()];
        let fetcher = EndpointFetcher::new(SampleParser::default(), Duration::from_secs(1));
        let aggregator = Aggregator::new(endpoints, fetcher, 0);

        let result = aggregator.run().await;
        assert!(result.is_empty());
        assert_eq!(result.successful_endpoints(), 0);
        assert_eq!(
            result.render(),
            "exporter_aggregator_successful_endpoints 0\n"
        );
    }
}
