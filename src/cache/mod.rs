//! Asset cache core.
//!
//! - [`entry`]: CacheEntry, EntryMetadata, VersionTag
//! - [`policy`]: Staleness policy (max age, optional version check)
//! - [`evictor`]: LRU eviction under byte and entry quotas
//! - [`orchestrator`]: Fetch-or-serve with request coalescing and stale fallback
//! - [`sweeper`]: Periodic idle purge and quota enforcement
//! - [`compressor`]: Optional zstd payload compression
//! - [`metrics`]: Prometheus counters and gauges

pub mod compressor;
pub mod entry;
pub mod evictor;
pub mod metrics;
pub mod orchestrator;
pub mod policy;
pub mod sweeper;

pub use entry::{CacheEntry, EntryMetadata, VersionTag};
pub use orchestrator::{AssetCache, CacheStats, Resolved, SharedCache, Source, StaleWarning};
pub use policy::StalenessPolicy;
