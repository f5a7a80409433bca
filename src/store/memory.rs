//! In-memory store. Same contract as the disk store, minus durability.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::cache::entry::{CacheEntry, EntryMetadata};
use crate::store::{check_capacity, Store, StoreError};

#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, CacheEntry>>,
    capacity_bytes: Option<u64>,
}

impl MemoryStore {
    pub fn new(capacity_bytes: Option<u64>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            capacity_bytes,
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn put(&self, entry: CacheEntry) -> Result<(), StoreError> {
        let mut entries = self.entries.write().await;
        let total: u64 = entries.values().map(CacheEntry::size_bytes).sum();
        let replaced = entries.get(entry.key()).map(CacheEntry::size_bytes).unwrap_or(0);
        check_capacity(self.capacity_bytes, total, replaced, entry.size_bytes())?;
        entries.insert(entry.key().to_string(), entry);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, StoreError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn metadata(&self, key: &str) -> Result<Option<EntryMetadata>, StoreError> {
        Ok(self.entries.read().await.get(key).map(|e| e.meta.clone()))
    }

    async fn touch(&self, key: &str, at: DateTime<Utc>) -> Result<bool, StoreError> {
        match self.entries.write().await.get_mut(key) {
            Some(entry) => {
                entry.meta.last_accessed_at = at;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.entries.write().await.remove(key).is_some())
    }

    async fn list_keys(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.entries.read().await.keys().cloned().collect())
    }

    async fn list_metadata(&self) -> Result<Vec<EntryMetadata>, StoreError> {
        Ok(self.entries.read().await.values().map(|e| e.meta.clone()).collect())
    }

    async fn total_size(&self) -> Result<u64, StoreError> {
        Ok(self.entries.read().await.values().map(CacheEntry::size_bytes).sum())
    }

    async fn clear(&self) -> Result<usize, StoreError> {
        let mut entries = self.entries.write().await;
        let removed = entries.len();
        entries.clear();
        Ok(removed)
    }
}
