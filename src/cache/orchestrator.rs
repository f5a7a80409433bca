//! Fetch-or-serve orchestrator: the cache's public face.
//!
//! `resolve` returns cached bytes when they are fresh. Otherwise it fetches, writes
//! through the store, enforces the quota, and hands the bytes back. Concurrent
//! requests for one key share a single in-flight fetch. The fetch runs in its own
//! task, so a caller that gives up does not cancel it for the others.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cache::entry::{CacheEntry, VersionTag};
use crate::cache::evictor::{EvictionReport, Evictor};
use crate::cache::metrics::CacheMetrics;
use crate::cache::policy::{Freshness, StalenessPolicy};
use crate::config::{Config, QuotaConfig, StalenessConfig};
use crate::fetch::{FetchError, Fetcher, Revalidation};
use crate::store::{Store, StoreError};

/// Where a resolved payload came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    /// Fresh cached entry.
    Hit,
    /// Fetched upstream and written to the store.
    Fetched,
    /// Cached entry confirmed current by a version check.
    Revalidated,
    /// Stale cached entry served because the fetch failed.
    Stale,
    /// Fetched upstream but not cached (storage failure or oversized).
    Uncached,
}

impl Source {
    /// Value for the `X-Cache` response header.
    pub fn as_header_value(&self) -> &'static str {
        match self {
            Source::Hit => "HIT",
            Source::Fetched => "MISS",
            Source::Revalidated => "REVALIDATED",
            Source::Stale => "STALE",
            Source::Uncached => "BYPASS",
        }
    }
}

/// Non-fatal warning attached to a stale response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaleWarning {
    /// Age of the served entry.
    pub age: Duration,
    /// Why the refresh failed.
    pub reason: String,
}

/// A successfully resolved asset.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub bytes: Bytes,
    pub source: Source,
    pub version_tag: VersionTag,
    pub content_type: Option<String>,
    pub warning: Option<StaleWarning>,
}

impl Resolved {
    fn from_entry(entry: CacheEntry, source: Source) -> Self {
        Self {
            bytes: entry.bytes,
            source,
            version_tag: entry.meta.version_tag,
            content_type: entry.meta.content_type,
            warning: None,
        }
    }
}

type FlightResult = Result<Resolved, FetchError>;
type SharedFlight = Shared<BoxFuture<'static, FlightResult>>;

/// An in-flight fetch for one key.
struct Flight {
    /// Distinguishes successive flights for the same key.
    id: u64,
    result: SharedFlight,
}

#[derive(Default)]
struct Registry {
    flights: HashMap<String, Flight>,
    /// Keys with a read in progress, and how many.
    reads: HashMap<String, usize>,
    next_flight_id: u64,
}

/// Keeps a key out of eviction while a hit is being served.
struct ReadLease<'a> {
    cache: &'a AssetCache,
    key: String,
}

impl Drop for ReadLease<'_> {
    fn drop(&mut self) {
        let mut registry = self.cache.registry();
        let released = match registry.reads.get_mut(&self.key) {
            Some(count) => {
                *count -= 1;
                *count == 0
            }
            None => false,
        };
        if released {
            registry.reads.remove(&self.key);
        }
    }
}

/// Point-in-time cache statistics.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub total_bytes: u64,
    pub max_bytes: u64,
    pub max_entries: usize,
    pub in_flight: usize,
    pub hits: u64,
    pub misses: u64,
    pub coalesced: u64,
    pub revalidated: u64,
    pub stale_served: u64,
    pub fetch_errors: u64,
    pub storage_errors: u64,
    pub evictions: u64,
}

/// Result of one sweeper pass.
#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    /// Keys purged for exceeding the idle TTL.
    pub purged: Vec<String>,
    pub eviction: EvictionReport,
}

/// The asset cache.
pub struct AssetCache {
    store: Arc<dyn Store>,
    evictor: Evictor,
    policy: StalenessPolicy,
    metrics: CacheMetrics,
    registry: Mutex<Registry>,
}

/// Cache handle passed to consumers.
pub type SharedCache = Arc<AssetCache>;

impl AssetCache {
    pub fn new(
        store: Arc<dyn Store>,
        quota: QuotaConfig,
        staleness: StalenessConfig,
    ) -> prometheus::Result<Self> {
        Ok(Self {
            store,
            evictor: Evictor::new(quota),
            policy: StalenessPolicy::new(staleness),
            metrics: CacheMetrics::new()?,
            registry: Mutex::new(Registry::default()),
        })
    }

    pub fn from_config(store: Arc<dyn Store>, config: &Config) -> prometheus::Result<Self> {
        Self::new(store, config.quota.clone(), config.staleness.clone())
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }

    /// Number of keys with a fetch in flight.
    pub fn in_flight_count(&self) -> usize {
        self.registry().flights.len()
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lease(&self, key: &str) -> ReadLease<'_> {
        *self.registry().reads.entry(key.to_string()).or_insert(0) += 1;
        ReadLease {
            cache: self,
            key: key.to_string(),
        }
    }

    /// Keys that must not be evicted right now: in flight or being read.
    fn protected_keys(&self) -> HashSet<String> {
        let registry = self.registry();
        registry
            .flights
            .keys()
            .chain(registry.reads.keys())
            .cloned()
            .collect()
    }

    /// Resolve `key`, using `fetcher` on a miss.
    pub async fn resolve<F>(self: &Arc<Self>, key: &str, fetcher: F) -> FlightResult
    where
        F: Fetcher + 'static,
    {
        self.resolve_with(key, Arc::new(fetcher)).await
    }

    /// Like [`resolve`](Self::resolve) with an already shared fetcher.
    pub async fn resolve_with(self: &Arc<Self>, key: &str, fetcher: Arc<dyn Fetcher>) -> FlightResult {
        if let Some(flight) = self.join_flight(key) {
            return flight.await;
        }

        // Version checks hit the network, so they always go through a flight.
        if !self.policy.version_check() {
            if let Some(resolved) = self.serve_fresh(key).await {
                return Ok(resolved);
            }
        }

        self.start_flight(key, fetcher).await
    }

    fn join_flight(&self, key: &str) -> Option<SharedFlight> {
        let registry = self.registry();
        let flight = registry.flights.get(key)?.result.clone();
        self.metrics.coalesced.inc();
        debug!(key = %key, "Joined in-flight fetch");
        Some(flight)
    }

    /// Hit path: serve a fresh entry straight from the store.
    async fn serve_fresh(&self, key: &str) -> Option<Resolved> {
        let _lease = self.lease(key);
        let entry = match self.store.get(key).await {
            Ok(Some(entry)) => entry,
            Ok(None) => return None,
            Err(e) => {
                // The flight retries the read and degrades if it fails again.
                debug!(key = %key, error = %e, "Lookup failed on hit path");
                return None;
            }
        };

        let now = Utc::now();
        if self.policy.is_stale(&entry.meta, now) {
            return None;
        }

        self.record_access(key, now).await;
        self.metrics.hits.inc();
        debug!(key = %key, size = entry.size_bytes(), "Cache hit");
        Some(Resolved::from_entry(entry, Source::Hit))
    }

    /// Register a flight for `key` (or join one registered meanwhile) and await it.
    async fn start_flight(self: &Arc<Self>, key: &str, fetcher: Arc<dyn Fetcher>) -> FlightResult {
        let flight = {
            let mut registry = self.registry();
            match registry.flights.get(key) {
                Some(existing) => {
                    self.metrics.coalesced.inc();
                    existing.result.clone()
                }
                None => {
                    let id = registry.next_flight_id;
                    registry.next_flight_id += 1;

                    let cache = Arc::clone(self);
                    let owned_key = key.to_string();
                    let task = tokio::spawn(async move {
                        let result = cache.run_flight(&owned_key, fetcher.as_ref()).await;
                        cache.finish_flight(&owned_key, id);
                        result
                    });

                    let cache = Arc::clone(self);
                    let owned_key = key.to_string();
                    let result = async move {
                        match task.await {
                            Ok(result) => result,
                            Err(e) => {
                                cache.finish_flight(&owned_key, id);
                                Err(FetchError::Internal(format!(
                                    "fetch task for {owned_key} failed: {e}"
                                )))
                            }
                        }
                    }
                    .boxed()
                    .shared();

                    registry.flights.insert(
                        key.to_string(),
                        Flight {
                            id,
                            result: result.clone(),
                        },
                    );
                    self.metrics.in_flight.set(registry.flights.len() as i64);
                    result
                }
            }
        };

        flight.await
    }

    fn finish_flight(&self, key: &str, id: u64) {
        let mut registry = self.registry();
        if registry.flights.get(key).map(|f| f.id) == Some(id) {
            registry.flights.remove(key);
        }
        self.metrics.in_flight.set(registry.flights.len() as i64);
    }

    /// Body of a flight. Runs in its own task.
    async fn run_flight(&self, key: &str, fetcher: &dyn Fetcher) -> FlightResult {
        // Re-read: a flight that finished since the caller's lookup may have filled the store.
        let cached = match self.store.get(key).await {
            Ok(entry) => entry,
            Err(e) => {
                self.record_storage_error(key, "get", &e);
                return self.fetch_uncached(key, fetcher).await;
            }
        };

        let Some(entry) = cached else {
            self.metrics.misses.inc();
            debug!(key = %key, "Cache miss");
            return self.fetch_and_store(key, fetcher, None).await;
        };

        let now = Utc::now();
        let freshness = self.policy.freshness(&entry.meta, now);

        if self.policy.version_check() {
            match fetcher.revalidate(key, &entry.meta.version_tag).await {
                Ok(Revalidation::Unchanged) => {
                    return Ok(self.serve_revalidated(entry, freshness, now).await);
                }
                Ok(Revalidation::Changed) => {
                    debug!(key = %key, version = %entry.meta.version_tag, "Upstream version changed");
                    self.metrics.misses.inc();
                    return self.fetch_and_store(key, fetcher, Some(entry)).await;
                }
                Ok(Revalidation::Unsupported) => {}
                Err(e) => {
                    debug!(key = %key, error = %e, "Version check failed, falling back to max age");
                }
            }
        }

        if freshness.is_fresh() {
            self.record_access(key, now).await;
            self.metrics.hits.inc();
            return Ok(Resolved::from_entry(entry, Source::Hit));
        }

        debug!(key = %key, "Cached entry expired, refreshing");
        self.metrics.misses.inc();
        self.fetch_and_store(key, fetcher, Some(entry)).await
    }

    /// Fetch, write through, and fall back to `previous` if the fetch fails.
    async fn fetch_and_store(
        &self,
        key: &str,
        fetcher: &dyn Fetcher,
        previous: Option<CacheEntry>,
    ) -> FlightResult {
        match fetcher.fetch(key).await {
            Ok(asset) => {
                let entry = CacheEntry::from_fetch(key, asset, Utc::now());
                let source = self.store_fetched(&entry, previous.is_some()).await;
                Ok(Resolved::from_entry(entry, source))
            }
            Err(err) => {
                self.metrics.fetch_errors.inc();
                let Some(stale) = previous else {
                    warn!(key = %key, error = %err, "Fetch failed with nothing cached");
                    return Err(err);
                };

                let now = Utc::now();
                let age = StalenessPolicy::age(&stale.meta, now);
                warn!(
                    key = %key,
                    error = %err,
                    age_secs = age.as_secs(),
                    "Fetch failed, serving stale entry"
                );
                self.metrics.stale_served.inc();
                self.record_access(key, now).await;

                let mut resolved = Resolved::from_entry(stale, Source::Stale);
                resolved.warning = Some(StaleWarning {
                    age,
                    reason: err.to_string(),
                });
                Ok(resolved)
            }
        }
    }

    /// Network-only path used when the store cannot be read.
    async fn fetch_uncached(&self, key: &str, fetcher: &dyn Fetcher) -> FlightResult {
        match fetcher.fetch(key).await {
            Ok(asset) => Ok(Resolved::from_entry(
                CacheEntry::from_fetch(key, asset, Utc::now()),
                Source::Uncached,
            )),
            Err(err) => {
                self.metrics.fetch_errors.inc();
                Err(err)
            }
        }
    }

    /// Write a freshly fetched entry and enforce the quota.
    async fn store_fetched(&self, entry: &CacheEntry, replaces: bool) -> Source {
        let key = entry.key();

        if !self.evictor.admits(entry.size_bytes()) {
            debug!(
                key = %key,
                size = entry.size_bytes(),
                max_bytes = self.evictor.quota().max_bytes,
                "Asset larger than quota, serving uncached"
            );
            if replaces {
                // Do not keep serving the superseded version.
                if let Err(e) = self.store.delete(key).await {
                    self.record_storage_error(key, "delete", &e);
                }
            }
            return Source::Uncached;
        }

        if let Err(e) = self.store.put(entry.clone()).await {
            self.record_storage_error(key, "put", &e);
            return Source::Uncached;
        }
        debug!(key = %key, size = entry.size_bytes(), version = %entry.meta.version_tag, "Stored asset");

        self.run_eviction().await;
        Source::Fetched
    }

    async fn serve_revalidated(
        &self,
        entry: CacheEntry,
        freshness: Freshness,
        now: DateTime<Utc>,
    ) -> Resolved {
        self.metrics.revalidated.inc();
        let key = entry.key().to_string();

        let entry = match freshness {
            Freshness::Fresh => {
                self.record_access(&key, now).await;
                entry
            }
            Freshness::Expired { .. } => {
                // Confirmed current: restart its max-age clock.
                let refreshed = entry.with_times(now, now);
                if let Err(e) = self.store.put(refreshed.clone()).await {
                    self.record_storage_error(&key, "put", &e);
                }
                refreshed
            }
        };

        debug!(key = %key, "Revalidated cached entry");
        Resolved::from_entry(entry, Source::Revalidated)
    }

    async fn record_access(&self, key: &str, now: DateTime<Utc>) {
        if let Err(e) = self.store.touch(key, now).await {
            self.record_storage_error(key, "touch", &e);
        }
    }

    fn record_storage_error(&self, key: &str, operation: &str, err: &StoreError) {
        self.metrics.storage_errors.inc();
        warn!(key = %key, operation, error = %err, "Storage error, continuing without cache");
    }

    fn record_eviction(&self, report: &EvictionReport) {
        self.metrics.evictions.inc_by(report.evicted.len() as u64);
        self.metrics.stored_bytes.set(report.remaining_bytes as i64);
        self.metrics.stored_entries.set(report.remaining_entries as i64);
    }

    /// Post-write eviction. Failures are logged, never surfaced to the caller.
    async fn run_eviction(&self) -> Option<EvictionReport> {
        let protected = self.protected_keys();
        match self.evictor.enforce_quota(self.store.as_ref(), &protected).await {
            Ok(report) => {
                self.record_eviction(&report);
                Some(report)
            }
            Err(e) => {
                self.metrics.storage_errors.inc();
                warn!(error = %e, "Eviction pass failed");
                None
            }
        }
    }

    /// Run an eviction pass now.
    pub async fn enforce_quota(&self) -> Result<EvictionReport, StoreError> {
        let protected = self.protected_keys();
        let report = self
            .evictor
            .enforce_quota(self.store.as_ref(), &protected)
            .await?;
        self.record_eviction(&report);
        Ok(report)
    }

    /// Purge idle entries, then enforce the quota. Called by the sweeper.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, StoreError> {
        let protected = self.protected_keys();
        let purged = self
            .evictor
            .purge_idle(self.store.as_ref(), &protected, now)
            .await?;
        self.metrics.evictions.inc_by(purged.len() as u64);

        let eviction = self.enforce_quota().await?;
        Ok(SweepReport { purged, eviction })
    }

    /// Drop one entry. Returns `false` if it was not cached.
    pub async fn invalidate(&self, key: &str) -> Result<bool, StoreError> {
        let removed = self.store.delete(key).await?;
        if removed {
            info!(key = %key, "Invalidated entry");
        }
        Ok(removed)
    }

    /// Drop every entry.
    pub async fn clear(&self) -> Result<usize, StoreError> {
        let removed = self.store.clear().await?;
        self.metrics.stored_bytes.set(0);
        self.metrics.stored_entries.set(0);
        info!(removed, "Cache cleared");
        Ok(removed)
    }

    pub async fn contains(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.store.metadata(key).await?.is_some())
    }

    pub async fn stats(&self) -> Result<CacheStats, StoreError> {
        let total_bytes = self.store.total_size().await?;
        let entries = self.store.list_keys().await?.len();
        self.metrics.stored_bytes.set(total_bytes as i64);
        self.metrics.stored_entries.set(entries as i64);

        let quota = self.evictor.quota();
        Ok(CacheStats {
            entries,
            total_bytes,
            max_bytes: quota.max_bytes,
            max_entries: quota.max_entries,
            in_flight: self.in_flight_count(),
            hits: self.metrics.hits.get(),
            misses: self.metrics.misses.get(),
            coalesced: self.metrics.coalesced.get(),
            revalidated: self.metrics.revalidated.get(),
            stale_served: self.metrics.stale_served.get(),
            fetch_errors: self.metrics.fetch_errors.get(),
            storage_errors: self.metrics.storage_errors.get(),
            evictions: self.metrics.evictions.get(),
        })
    }
}
