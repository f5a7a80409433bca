//! asset-cache: persistent cache for binary assets.
//!
//! Fetched assets are written through a key-value store (disk or memory), served
//! back while fresh, and evicted least-recently-used under byte and entry quotas.
//! Concurrent requests for one key share a single upstream fetch, and a failed
//! refresh falls back to the stale copy.

pub mod cache;
pub mod config;
pub mod fetch;
pub mod server;
pub mod store;
