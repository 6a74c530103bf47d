use std::sync::Arc;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

use crate::error::ResolveError;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OutcomeLabels {
    pub outcome: Outcome,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Outcome {
    Success,
    PolicyBlocked,
    NotFound,
    Upstream,
    Canceled,
    Timeout,
    Unreachable,
    Storage,
}

impl From<&ResolveError> for Outcome {
    fn from(err: &ResolveError) -> Self {
        match err {
            ResolveError::PolicyBlocked => Outcome::PolicyBlocked,
            ResolveError::NotFound => Outcome::NotFound,
            ResolveError::UpstreamStatus(_) => Outcome::Upstream,
            ResolveError::Canceled => Outcome::Canceled,
            ResolveError::Timeout(_) => Outcome::Timeout,
            ResolveError::Unreachable(_) => Outcome::Unreachable,
            ResolveError::Storage(_) => Outcome::Storage,
        }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RemoteLabels {
    pub remote: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RefractionLabels {
    pub refraction: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ProbeLabels {
    pub class: ProbeClass,
}

/// Outcome class of one member probe inside a fan-out, in tie-break order.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum ProbeClass {
    Success,
    Denied,
    Fault,
    Absent,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Central container for every Prometheus metric exposed by the proxy.
pub struct Metrics {
    // -- resolutions --
    pub resolve_total: Family<OutcomeLabels, Counter>,
    pub resolve_duration_seconds: Family<RefractionLabels, Histogram>,

    // -- cache --
    pub cache_hits: Family<RemoteLabels, Counter>,
    pub cache_misses: Family<RemoteLabels, Counter>,
    pub storage_write_failures: Counter,

    // -- fan-out --
    pub probe_results: Family<ProbeLabels, Counter>,

    // -- partitioning --
    pub partition_rewrites: Counter,
    pub partition_exchange_failures: Counter,

    // -- gauges --
    pub active_requests: Gauge,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let resolve_total = Family::<OutcomeLabels, Counter>::default();
        registry.register(
            "pkgcache_resolve_total",
            "Total artifact resolutions by terminal outcome",
            resolve_total.clone(),
        );

        let resolve_duration_seconds =
            Family::<RefractionLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.01, 2.0, 14))
            });
        registry.register(
            "pkgcache_resolve_duration_seconds",
            "Artifact resolution latency in seconds",
            resolve_duration_seconds.clone(),
        );

        let cache_hits = Family::<RemoteLabels, Counter>::default();
        registry.register(
            "pkgcache_cache_hits_total",
            "Requests served from the blob store, by remote",
            cache_hits.clone(),
        );

        let cache_misses = Family::<RemoteLabels, Counter>::default();
        registry.register(
            "pkgcache_cache_misses_total",
            "Cacheable requests that had to go upstream, by remote",
            cache_misses.clone(),
        );

        let storage_write_failures = Counter::default();
        registry.register(
            "pkgcache_storage_write_failures_total",
            "Cache fill writes that failed after the response was served",
            storage_write_failures.clone(),
        );

        let probe_results = Family::<ProbeLabels, Counter>::default();
        registry.register(
            "pkgcache_probe_results_total",
            "Member probe outcomes by tie-break class",
            probe_results.clone(),
        );

        let partition_rewrites = Counter::default();
        registry.register(
            "pkgcache_partition_rewrites_total",
            "Credentials successfully exchanged for a partition identity",
            partition_rewrites.clone(),
        );

        let partition_exchange_failures = Counter::default();
        registry.register(
            "pkgcache_partition_exchange_failures_total",
            "Identity exchanges that failed and fell back to the raw credential",
            partition_exchange_failures.clone(),
        );

        let active_requests: Gauge = Gauge::default();
        registry.register(
            "pkgcache_active_requests",
            "Resolutions currently in flight",
            active_requests.clone(),
        );

        Self {
            resolve_total,
            resolve_duration_seconds,
            cache_hits,
            cache_misses,
            storage_write_failures,
            probe_results,
            partition_rewrites,
            partition_exchange_failures,
            active_requests,
        }
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the metrics registry, used in [`AppState`].
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
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
