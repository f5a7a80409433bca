//! Key-value persistence layer.
//!
//! - [`disk`]: durable one-record-per-key store on the local filesystem
//! - [`memory`]: process-local store for tests and ephemeral deployments
//!
//! A missing key is a normal outcome (`None` / `false`), never a `StoreError`.

pub mod disk;
pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::cache::compressor::CompressionError;
use crate::cache::entry::{CacheEntry, EntryMetadata};
use crate::config::{Config, StoreBackend};

pub use disk::DiskStore;
pub use memory::MemoryStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt record at {location}: {reason}")]
    Corrupt { location: String, reason: String },

    #[error("Storage quota exceeded: {requested} bytes requested, {available} available")]
    QuotaExceeded { requested: u64, available: u64 },

    #[error("Metadata encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("Payload codec failed: {0}")]
    Compression(#[from] CompressionError),
}

/// Durable asynchronous key → blob store.
#[async_trait]
pub trait Store: Send + Sync {
    /// Atomically write `entry`, replacing any existing record for its key.
    async fn put(&self, entry: CacheEntry) -> Result<(), StoreError>;

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, StoreError>;

    /// Metadata only, without reading the payload.
    async fn metadata(&self, key: &str) -> Result<Option<EntryMetadata>, StoreError>;

    /// Update `last_accessed_at`. Returns `false` if the key is absent.
    async fn touch(&self, key: &str, at: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Returns `false` if the key was absent.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Snapshot of all keys at call time.
    async fn list_keys(&self) -> Result<Vec<String>, StoreError>;

    /// Snapshot of all entry metadata at call time.
    async fn list_metadata(&self) -> Result<Vec<EntryMetadata>, StoreError>;

    /// Sum of `size_bytes` over all entries.
    async fn total_size(&self) -> Result<u64, StoreError>;

    /// Remove every entry. Returns how many were removed.
    async fn clear(&self) -> Result<usize, StoreError>;
}

/// Open the backend selected by `config.store`.
pub async fn open_store(config: &Config) -> Result<Arc<dyn Store>, StoreError> {
    match config.store.backend {
        StoreBackend::Disk => {
            let store = DiskStore::open(config.store.clone(), config.compression.clone()).await?;
            Ok(Arc::new(store))
        }
        StoreBackend::Memory => Ok(Arc::new(MemoryStore::new(config.store.capacity_bytes))),
    }
}

/// Engine-level capacity check shared by the backends.
pub(crate) fn check_capacity(
    capacity: Option<u64>,
    current_total: u64,
    replaced: u64,
    incoming: u64,
) -> Result<(), StoreError> {
    let Some(capacity) = capacity else {
        return Ok(());
    };
    let after_removal = current_total.saturating_sub(replaced);
    let available = capacity.saturating_sub(after_removal);
    if incoming > available {
        return Err(StoreError::QuotaExceeded {
            requested: incoming,
            available,
        });
    }
    Ok(())
}
