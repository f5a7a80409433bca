//! Eviction policy: decides which entries to delete when the store is over quota.
//!
//! Plain LRU: the entry with the oldest `last_accessed_at` goes first, ties broken
//! by oldest `stored_at`, then by key so the order is total.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cache::entry::EntryMetadata;
use crate::config::QuotaConfig;
use crate::store::{Store, StoreError};

/// An eviction candidate taken from a metadata snapshot.
#[derive(Debug, Clone)]
pub struct EvictionCandidate {
    pub key: String,
    pub size_bytes: u64,
    pub last_accessed_at: DateTime<Utc>,
    pub stored_at: DateTime<Utc>,
}

impl EvictionCandidate {
    fn from_meta(meta: &EntryMetadata) -> Self {
        Self {
            key: meta.key.clone(),
            size_bytes: meta.size_bytes,
            last_accessed_at: meta.last_accessed_at,
            stored_at: meta.stored_at,
        }
    }

    /// Whether `current` is still the record this candidate was taken from.
    fn matches(&self, current: &EntryMetadata) -> bool {
        current.last_accessed_at == self.last_accessed_at && current.stored_at == self.stored_at
    }
}

// Greater = evicted first, so the max-heap pops the least recently used entry.
impl PartialEq for EvictionCandidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for EvictionCandidate {}

impl PartialOrd for EvictionCandidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for EvictionCandidate {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .last_accessed_at
            .cmp(&self.last_accessed_at)
            .then_with(|| other.stored_at.cmp(&self.stored_at))
            .then_with(|| other.key.cmp(&self.key))
    }
}

/// Result of one eviction pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EvictionReport {
    /// Keys deleted, in eviction order.
    pub evicted: Vec<String>,
    pub bytes_freed: u64,
    pub remaining_bytes: u64,
    pub remaining_entries: usize,
    /// Whether both bounds hold after the pass.
    pub satisfied: bool,
}

/// The eviction policy engine.
pub struct Evictor {
    config: QuotaConfig,
}

impl Evictor {
    pub fn new(config: QuotaConfig) -> Self {
        Self { config }
    }

    pub fn quota(&self) -> &QuotaConfig {
        &self.config
    }

    /// Whether `bytes`/`entries` exceed either bound. A bound of 0 is disabled.
    pub fn is_over_quota(&self, bytes: u64, entries: usize) -> bool {
        (self.config.max_bytes > 0 && bytes > self.config.max_bytes)
            || (self.config.max_entries > 0 && entries > self.config.max_entries)
    }

    /// Whether a single payload of this size could ever be kept.
    pub fn admits(&self, size_bytes: u64) -> bool {
        self.config.max_bytes == 0 || size_bytes <= self.config.max_bytes
    }

    /// Evict least recently used entries until both bounds hold.
    ///
    /// The snapshot may be stale by the time each candidate is reached. Every
    /// candidate is re-validated first and skipped if it has vanished, been
    /// touched, or been replaced since the snapshot.
    pub async fn enforce_quota(
        &self,
        store: &dyn Store,
        protected: &HashSet<String>,
    ) -> Result<EvictionReport, StoreError> {
        let snapshot = store.list_metadata().await?;
        let mut bytes: u64 = snapshot.iter().map(|m| m.size_bytes).sum();
        let mut count = snapshot.len();

        let mut report = EvictionReport::default();
        if !self.is_over_quota(bytes, count) {
            report.remaining_bytes = bytes;
            report.remaining_entries = count;
            report.satisfied = true;
            return Ok(report);
        }

        let mut heap: BinaryHeap<EvictionCandidate> = snapshot
            .iter()
            .filter(|m| !protected.contains(&m.key))
            .map(EvictionCandidate::from_meta)
            .collect();

        while self.is_over_quota(bytes, count) {
            let Some(candidate) = heap.pop() else {
                break;
            };

            match store.metadata(&candidate.key).await? {
                None => {
                    // Already gone; the snapshot overcounted.
                    bytes = bytes.saturating_sub(candidate.size_bytes);
                    count = count.saturating_sub(1);
                    continue;
                }
                Some(current) if !candidate.matches(&current) => {
                    // Touched or replaced: requeue at its new position.
                    debug!(key = %candidate.key, "Entry changed since snapshot, requeueing");
                    bytes = bytes
                        .saturating_sub(candidate.size_bytes)
                        .saturating_add(current.size_bytes);
                    heap.push(EvictionCandidate::from_meta(&current));
                    continue;
                }
                Some(_) => {}
            }

            if store.delete(&candidate.key).await? {
                bytes = bytes.saturating_sub(candidate.size_bytes);
                count = count.saturating_sub(1);
                report.bytes_freed += candidate.size_bytes;
                debug!(
                    key = %candidate.key,
                    size = candidate.size_bytes,
                    last_accessed_at = %candidate.last_accessed_at,
                    "Evicted entry"
                );
                report.evicted.push(candidate.key);
            }
        }

        report.remaining_bytes = store.total_size().await?;
        report.remaining_entries = store.list_keys().await?.len();
        report.satisfied = !self.is_over_quota(report.remaining_bytes, report.remaining_entries);

        if !report.evicted.is_empty() {
            info!(
                evicted = report.evicted.len(),
                bytes_freed = report.bytes_freed,
                remaining_bytes = report.remaining_bytes,
                remaining_entries = report.remaining_entries,
                "Eviction round complete"
            );
        }
        if !report.satisfied {
            warn!(
                remaining_bytes = report.remaining_bytes,
                remaining_entries = report.remaining_entries,
                protected = protected.len(),
                "Quota still exceeded after eviction; remaining entries are protected"
            );
        }

        Ok(report)
    }

    /// Delete entries not accessed within `idle_ttl_secs`, if configured.
    pub async fn purge_idle(
        &self,
        store: &dyn Store,
        protected: &HashSet<String>,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>, StoreError> {
        let Some(idle_ttl) = self.config.idle_ttl_secs else {
            return Ok(Vec::new());
        };
        let idle_ttl = Duration::from_secs(idle_ttl);

        let mut purged = Vec::new();
        for meta in store.list_metadata().await? {
            if protected.contains(&meta.key) {
                continue;
            }
            let idle = (now - meta.last_accessed_at).to_std().unwrap_or_default();
            if idle <= idle_ttl {
                continue;
            }
            // Re-check: a hit since the snapshot revives the entry.
            match store.metadata(&meta.key).await? {
                Some(current) if current.last_accessed_at == meta.last_accessed_at => {}
                _ => continue,
            }
            if store.delete(&meta.key).await? {
                debug!(key = %meta.key, idle_secs = idle.as_secs(), "Purged idle entry");
                purged.push(meta.key);
            }
        }

        if !purged.is_empty() {
            info!(purged = purged.len(), "Idle purge complete");
        }
        Ok(purged)
    }
}
