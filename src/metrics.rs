use std::sync::Arc;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct CacheLabels {
    pub cache: CacheOutcome,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum CacheOutcome {
    Hit,
    Miss,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct CategoryLabels {
    pub category: String,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Central container for every Prometheus metric exposed by the proxy.
pub struct Metrics {
    /// Proxied requests by cache outcome.
    pub requests_total: Family<CacheLabels, Counter>,
    /// Upstream API calls by rate-limit category.
    pub upstream_calls_total: Family<CategoryLabels, Counter>,
    /// Requests denied by the per-key token bucket.
    pub rate_limited_total: Counter,
    /// Donated tokens marked revoked after an upstream auth failure.
    pub token_revocations_total: Counter,
    /// Cache rows removed by the janitor (TTL + size trim).
    pub cache_evictions_total: Counter,
    /// Last observed footprint of the cached-response table.
    pub cache_table_bytes: Gauge,
}

impl Metrics {
    pub fn new(registry: &mut Registry) -> Self {
        let requests_total = Family::<CacheLabels, Counter>::default();
        registry.register(
            "ghproxy_requests_total",
            "Proxied requests by cache outcome",
            requests_total.clone(),
        );

        let upstream_calls_total = Family::<CategoryLabels, Counter>::default();
        registry.register(
            "ghproxy_upstream_calls_total",
            "Upstream API calls by rate-limit category",
            upstream_calls_total.clone(),
        );

        let rate_limited_total = Counter::default();
        registry.register(
            "ghproxy_rate_limited_total",
            "Requests denied by the per-key token bucket",
            rate_limited_total.clone(),
        );

        let token_revocations_total = Counter::default();
        registry.register(
            "ghproxy_token_revocations_total",
            "Donated tokens marked revoked",
            token_revocations_total.clone(),
        );

        let cache_evictions_total = Counter::default();
        registry.register(
            "ghproxy_cache_evictions_total",
            "Cache rows deleted by the janitor",
            cache_evictions_total.clone(),
        );

        let cache_table_bytes: Gauge = Gauge::default();
        registry.register(
            "ghproxy_cache_table_bytes",
            "Observed footprint of the cached-response table",
            cache_table_bytes.clone(),
        );

        Self {
            requests_total,
            upstream_calls_total,
            rate_limited_total,
            token_revocations_total,
            cache_evictions_total,
            cache_table_bytes,
        }
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the metrics registry, stored in `AppState`.
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all proxy metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_encode_without_panicking() {
        let registry = MetricsRegistry::new();
        registry
            .metrics
            .requests_total
            .get_or_create(&CacheLabels {
                cache: CacheOutcome::Hit,
            })
            .inc();
        registry.metrics.rate_limited_total.inc();

        let mut buf = String::new();
        prometheus_client::encoding::text::encode(&mut buf, &registry.registry).unwrap();
        assert!(buf.contains("ghproxy_requests_total"));
        assert!(buf.contains("ghproxy_rate_limited_total"));
    }
}
