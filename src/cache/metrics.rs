//! Prometheus metrics for one cache instance.
//!
//! Each cache owns its own `Registry`, so several caches (or tests) can live in
//! one process without name collisions.

use prometheus::{Encoder, IntCounter, IntGauge, Opts, Registry, TextEncoder};

#[derive(Clone)]
pub struct CacheMetrics {
    registry: Registry,

    pub hits: IntCounter,
    pub misses: IntCounter,
    /// Callers that joined an existing in-flight request.
    pub coalesced: IntCounter,
    pub revalidated: IntCounter,
    /// Responses served from a stale entry after a failed fetch.
    pub stale_served: IntCounter,
    pub fetch_errors: IntCounter,
    pub storage_errors: IntCounter,
    pub evictions: IntCounter,

    pub stored_bytes: IntGauge,
    pub stored_entries: IntGauge,
    pub in_flight: IntGauge,
}

fn counter(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntCounter> {
    let counter = IntCounter::with_opts(Opts::new(name, help).namespace("asset_cache"))?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntGauge> {
    let gauge = IntGauge::with_opts(Opts::new(name, help).namespace("asset_cache"))?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

impl CacheMetrics {
    /// Create and register all metrics in a fresh registry.
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();
        Ok(Self {
            hits: counter(&registry, "hits_total", "Requests served from a fresh cached entry")?,
            misses: counter(&registry, "misses_total", "Requests that required an upstream fetch")?,
            coalesced: counter(&registry, "coalesced_total", "Requests that joined an in-flight fetch")?,
            revalidated: counter(&registry, "revalidated_total", "Cached entries confirmed current upstream")?,
            stale_served: counter(&registry, "stale_served_total", "Stale entries served after a failed fetch")?,
            fetch_errors: counter(&registry, "fetch_errors_total", "Failed upstream fetches")?,
            storage_errors: counter(&registry, "storage_errors_total", "Persistence layer failures")?,
            evictions: counter(&registry, "evictions_total", "Entries removed to satisfy quota or idle TTL")?,
            stored_bytes: gauge(&registry, "stored_bytes", "Payload bytes currently stored")?,
            stored_entries: gauge(&registry, "stored_entries", "Entries currently stored")?,
            in_flight: gauge(&registry, "in_flight", "Fetches currently in flight")?,
            registry,
        })
    }

    /// Render all metrics in the Prometheus text format.
    pub fn encode(&self) -> prometheus::Result<Vec<u8>> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }
}
