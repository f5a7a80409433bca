//! Staleness policy: decides when a cached entry must be refreshed.
//!
//! The default policy treats every entry as immutable. That is right when keys
//! already encode a version or content hash.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::cache::entry::EntryMetadata;
use crate::config::StalenessConfig;

/// Freshness of an entry at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    /// Older than the configured max age.
    Expired { age: Duration },
}

impl Freshness {
    pub fn is_fresh(&self) -> bool {
        matches!(self, Freshness::Fresh)
    }
}

#[derive(Debug, Clone, Default)]
pub struct StalenessPolicy {
    config: StalenessConfig,
}

impl StalenessPolicy {
    pub fn new(config: StalenessConfig) -> Self {
        Self { config }
    }

    /// Entries never expire by age.
    pub fn immutable() -> Self {
        Self::default()
    }

    /// Entries expire `secs` seconds after they were stored.
    pub fn max_age(secs: u64) -> Self {
        Self::new(StalenessConfig {
            max_age_secs: Some(secs),
            version_check: false,
        })
    }

    pub fn version_check(&self) -> bool {
        self.config.version_check
    }

    /// Time since the entry was stored. Clock skew into the future counts as zero.
    pub fn age(entry: &EntryMetadata, now: DateTime<Utc>) -> Duration {
        (now - entry.stored_at).to_std().unwrap_or_default()
    }

    pub fn freshness(&self, entry: &EntryMetadata, now: DateTime<Utc>) -> Freshness {
        let Some(max_age) = self.config.max_age_secs else {
            return Freshness::Fresh;
        };
        let age = Self::age(entry, now);
        if age > Duration::from_secs(max_age) {
            Freshness::Expired { age }
        } else {
            Freshness::Fresh
        }
    }

    /// Whether the entry has outlived the max age.
    ///
    /// A remote version check is separate and asynchronous; see `AssetCache::resolve`.
    pub fn is_stale(&self, entry: &EntryMetadata, now: DateTime<Utc>) -> bool {
        !self.freshness(entry, now).is_fresh()
    }
}
