//! Prometheus metrics.
//!
//! Each [`Metrics`] owns its own registry, so several gateways (or tests)
//! can live in one process without name collisions.

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

/// Container for all gateway metrics.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,

    pub cache_hits: IntCounter,
    pub cache_misses: IntCounter,
    pub cache_writes: IntCounter,
    /// Backend faults swallowed by the cache store.
    pub cache_errors: IntCounter,

    /// Computations currently in flight under the stampede guard.
    pub in_flight: IntGauge,
    /// Callers that joined someone else's computation.
    pub coalesced: IntCounter,

    /// Admission decisions - labels: tier, outcome
    pub admissions: IntCounterVec,

    /// Origin queries - labels: endpoint, outcome
    pub origin_queries: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let cache_hits = IntCounter::new("gateway_cache_hits_total", "Cache lookups served")?;
        let cache_misses = IntCounter::new("gateway_cache_misses_total", "Cache lookups missed")?;
        let cache_writes = IntCounter::new("gateway_cache_writes_total", "Cache writes")?;
        let cache_errors =
            IntCounter::new("gateway_cache_errors_total", "Cache backend faults swallowed")?;
        let in_flight = IntGauge::new(
            "gateway_inflight_computations",
            "Cache fills currently being computed",
        )?;
        let coalesced = IntCounter::new(
            "gateway_coalesced_requests_total",
            "Requests that waited on an in-flight computation",
        )?;
        let admissions = IntCounterVec::new(
            Opts::new("gateway_admissions_total", "Rate limiter decisions"),
            &["tier", "outcome"],
        )?;
        let origin_queries = IntCounterVec::new(
            Opts::new("gateway_origin_queries_total", "Queries sent to backing stores"),
            &["endpoint", "outcome"],
        )?;

        registry.register(Box::new(cache_hits.clone()))?;
        registry.register(Box::new(cache_misses.clone()))?;
        registry.register(Box::new(cache_writes.clone()))?;
        registry.register(Box::new(cache_errors.clone()))?;
        registry.register(Box::new(in_flight.clone()))?;
        registry.register(Box::new(coalesced.clone()))?;
        registry.register(Box::new(admissions.clone()))?;
        registry.register(Box::new(origin_queries.clone()))?;

        Ok(Self {
            registry,
            cache_hits,
            cache_misses,
            cache_writes,
            cache_errors,
            in_flight,
            coalesced,
            admissions,
            origin_queries,
        })
    }

    /// Render every metric in the Prometheus text format.
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!(error = %e, "Failed to encode metrics");
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}
