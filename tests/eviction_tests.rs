//! Tests for LRU eviction under byte and entry quotas.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use asset_cache::cache::entry::{CacheEntry, EntryMetadata, VersionTag};
use asset_cache::cache::evictor::Evictor;
use asset_cache::cache::orchestrator::{AssetCache, Source};
use asset_cache::config::{QuotaConfig, StalenessConfig};
use asset_cache::fetch::{FetchError, FetchedAsset};
use asset_cache::store::{MemoryStore, Store, StoreError};

fn quota(max_bytes: u64, max_entries: usize) -> QuotaConfig {
    QuotaConfig {
        max_bytes,
        max_entries,
        idle_ttl_secs: None,
    }
}

/// Entry of `size` bytes last accessed `secs_ago` seconds before `now`.
fn aged_entry(key: &str, size: usize, secs_ago: i64, now: DateTime<Utc>) -> CacheEntry {
    let at = now - chrono::Duration::seconds(secs_ago);
    CacheEntry::new(key, Bytes::from(vec![1u8; size]), VersionTag::new("v"), None, at)
}

#[tokio::test]
async fn test_first_of_three_evicted_under_byte_quota() {
    let cache = Arc::new(
        AssetCache::new(
            Arc::new(MemoryStore::new(None)),
            quota(1000, 0),
            StalenessConfig::default(),
        )
        .unwrap(),
    );
    let fetcher = |_key: String| async { Ok::<_, FetchError>(FetchedAsset::new(Bytes::from(vec![0u8; 400]))) };

    for key in ["a", "b", "c"] {
        cache.resolve(key, fetcher).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert!(!cache.contains("a").await.unwrap());
    assert!(cache.contains("b").await.unwrap());
    assert!(cache.contains("c").await.unwrap());
    assert_eq!(cache.store().total_size().await.unwrap(), 800);
    assert_eq!(cache.metrics().evictions.get(), 1);
}

#[tokio::test]
async fn test_recently_touched_entry_survives() {
    let now = Utc::now();
    let store = MemoryStore::new(None);
    store.put(aged_entry("a", 10, 300, now)).await.unwrap();
    store.put(aged_entry("b", 10, 200, now)).await.unwrap();
    store.put(aged_entry("c", 10, 100, now)).await.unwrap();
    store.touch("a", now).await.unwrap();

    let evictor = Evictor::new(quota(0, 2));
    let report = evictor.enforce_quota(&store, &HashSet::new()).await.unwrap();

    assert_eq!(report.evicted, vec!["b".to_string()]);
    assert!(report.satisfied);
    assert!(store.get("a").await.unwrap().is_some());
}

#[tokio::test]
async fn test_bounds_hold_after_enforcement() {
    let now = Utc::now();
    let store = MemoryStore::new(None);
    for i in 0..50 {
        let size = 10 + (i * 37) % 90;
        store
            .put(aged_entry(&format!("k{i}"), size, (i * 13 % 50) as i64, now))
            .await
            .unwrap();
    }

    let evictor = Evictor::new(quota(1500, 20));
    let report = evictor.enforce_quota(&store, &HashSet::new()).await.unwrap();

    assert!(report.satisfied);
    assert!(store.total_size().await.unwrap() <= 1500);
    assert!(store.list_keys().await.unwrap().len() <= 20);
    assert_eq!(report.remaining_bytes, store.total_size().await.unwrap());
}

#[tokio::test]
async fn test_eviction_follows_lru_order() {
    let now = Utc::now();
    let store = MemoryStore::new(None);
    for i in 0..10 {
        // k0 is the most recently used.
        store.put(aged_entry(&format!("k{i}"), 1, i * 10, now)).await.unwrap();
    }

    let evictor = Evictor::new(quota(0, 5));
    let report = evictor.enforce_quota(&store, &HashSet::new()).await.unwrap();

    assert_eq!(report.evicted, vec!["k9", "k8", "k7", "k6", "k5"]);
}

#[tokio::test]
async fn test_protected_keys_are_skipped() {
    let now = Utc::now();
    let store = MemoryStore::new(None);
    store.put(aged_entry("in-flight", 10, 500, now)).await.unwrap();
    store.put(aged_entry("idle", 10, 100, now)).await.unwrap();

    let protected: HashSet<String> = ["in-flight".to_string()].into_iter().collect();
    let evictor = Evictor::new(quota(0, 1));
    let report = evictor.enforce_quota(&store, &protected).await.unwrap();

    assert_eq!(report.evicted, vec!["idle".to_string()]);
    assert!(store.get("in-flight").await.unwrap().is_some());
}

#[tokio::test]
async fn test_all_protected_reports_unsatisfied() {
    let now = Utc::now();
    let store = MemoryStore::new(None);
    store.put(aged_entry("a", 10, 10, now)).await.unwrap();
    store.put(aged_entry("b", 10, 20, now)).await.unwrap();

    let protected: HashSet<String> = ["a".to_string(), "b".to_string()].into_iter().collect();
    let evictor = Evictor::new(quota(0, 1));
    let report = evictor.enforce_quota(&store, &protected).await.unwrap();

    assert!(report.evicted.is_empty());
    assert!(!report.satisfied);
}

/// Serves a fixed, possibly outdated metadata snapshot over a live store.
struct StaleSnapshotStore {
    inner: MemoryStore,
    snapshot: Vec<EntryMetadata>,
}

#[async_trait]
impl Store for StaleSnapshotStore {
    async fn put(&self, entry: CacheEntry) -> Result<(), StoreError> {
        self.inner.put(entry).await
    }
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, StoreError> {
        self.inner.get(key).await
    }
    async fn metadata(&self, key: &str) -> Result<Option<EntryMetadata>, StoreError> {
        self.inner.metadata(key).await
    }
    async fn touch(&self, key: &str, at: DateTime<Utc>) -> Result<bool, StoreError> {
        self.inner.touch(key, at).await
    }
    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.inner.delete(key).await
    }
    async fn list_keys(&self) -> Result<Vec<String>, StoreError> {
        self.inner.list_keys().await
    }
    async fn list_metadata(&self) -> Result<Vec<EntryMetadata>, StoreError> {
        Ok(self.snapshot.clone())
    }
    async fn total_size(&self) -> Result<u64, StoreError> {
        self.inner.total_size().await
    }
    async fn clear(&self) -> Result<usize, StoreError> {
        self.inner.clear().await
    }
}

#[tokio::test]
async fn test_entry_removed_since_snapshot_is_tolerated() {
    let now = Utc::now();
    let inner = MemoryStore::new(None);
    inner.put(aged_entry("a", 10, 300, now)).await.unwrap();
    inner.put(aged_entry("b", 10, 200, now)).await.unwrap();
    inner.put(aged_entry("c", 10, 100, now)).await.unwrap();
    let snapshot = inner.list_metadata().await.unwrap();

    // Another actor removes the oldest entry after the snapshot was taken.
    inner.delete("a").await.unwrap();
    let store = StaleSnapshotStore { inner, snapshot };

    let evictor = Evictor::new(quota(0, 2));
    let report = evictor.enforce_quota(&store, &HashSet::new()).await.unwrap();

    assert!(report.evicted.is_empty());
    assert!(report.satisfied);
    assert_eq!(store.list_keys().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_entry_touched_since_snapshot_is_requeued() {
    let now = Utc::now();
    let inner = MemoryStore::new(None);
    inner.put(aged_entry("a", 10, 300, now)).await.unwrap();
    inner.put(aged_entry("b", 10, 200, now)).await.unwrap();
    inner.put(aged_entry("c", 10, 100, now)).await.unwrap();
    let snapshot = inner.list_metadata().await.unwrap();

    // "a" is read after the snapshot, making "b" the least recently used.
    inner.touch("a", now).await.unwrap();
    let store = StaleSnapshotStore { inner, snapshot };

    let evictor = Evictor::new(quota(0, 2));
    let report = evictor.enforce_quota(&store, &HashSet::new()).await.unwrap();

    assert_eq!(report.evicted, vec!["b".to_string()]);
    assert!(store.get("a").await.unwrap().is_some());
}

/// Holds the first armed `get` until released.
struct GatedStore {
    inner: MemoryStore,
    armed: AtomicBool,
    entered: Notify,
    release: Notify,
}

#[async_trait]
impl Store for GatedStore {
    async fn put(&self, entry: CacheEntry) -> Result<(), StoreError> {
        self.inner.put(entry).await
    }
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, StoreError> {
        if self.armed.swap(false, Ordering::SeqCst) {
            self.entered.notify_one();
            self.release.notified().await;
        }
        self.inner.get(key).await
    }
    async fn metadata(&self, key: &str) -> Result<Option<EntryMetadata>, StoreError> {
        self.inner.metadata(key).await
    }
    async fn touch(&self, key: &str, at: DateTime<Utc>) -> Result<bool, StoreError> {
        self.inner.touch(key, at).await
    }
    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.inner.delete(key).await
    }
    async fn list_keys(&self) -> Result<Vec<String>, StoreError> {
        self.inner.list_keys().await
    }
    async fn list_metadata(&self) -> Result<Vec<EntryMetadata>, StoreError> {
        self.inner.list_metadata().await
    }
    async fn total_size(&self) -> Result<u64, StoreError> {
        self.inner.total_size().await
    }
    async fn clear(&self) -> Result<usize, StoreError> {
        self.inner.clear().await
    }
}

#[tokio::test]
async fn test_entry_being_read_is_not_evicted() {
    let now = Utc::now();
    let inner = MemoryStore::new(None);
    inner.put(aged_entry("a", 10, 300, now)).await.unwrap();
    inner.put(aged_entry("b", 10, 100, now)).await.unwrap();
    let store = Arc::new(GatedStore {
        inner,
        armed: AtomicBool::new(true),
        entered: Notify::new(),
        release: Notify::new(),
    });
    let cache = Arc::new(AssetCache::new(store.clone(), quota(0, 1), StalenessConfig::default()).unwrap());

    let reader = {
        let cache = cache.clone();
        tokio::spawn(async move {
            let fetcher = |_key: String| async { Ok::<_, FetchError>(FetchedAsset::new(Bytes::from_static(b"net"))) };
            cache.resolve("a", fetcher).await
        })
    };

    // "a" is the LRU entry, but its read is still in progress.
    store.entered.notified().await;
    let report = cache.enforce_quota().await.unwrap();
    assert_eq!(report.evicted, vec!["b".to_string()]);
    assert!(store.inner.metadata("a").await.unwrap().is_some());

    store.release.notify_one();
    let resolved = reader.await.unwrap().unwrap();
    assert_eq!(resolved.source, Source::Hit);
    assert_eq!(&resolved.bytes[..], &[1u8; 10][..]);
}

#[tokio::test]
async fn test_idle_entries_purged() {
    let now = Utc::now();
    let store = MemoryStore::new(None);
    store.put(aged_entry("idle", 10, 7200, now)).await.unwrap();
    store.put(aged_entry("recent", 10, 10, now)).await.unwrap();

    let evictor = Evictor::new(QuotaConfig {
        max_bytes: 0,
        max_entries: 0,
        idle_ttl_secs: Some(3600),
    });
    let purged = evictor.purge_idle(&store, &HashSet::new(), now).await.unwrap();

    assert_eq!(purged, vec!["idle".to_string()]);
    assert!(store.get("recent").await.unwrap().is_some());
}
