//! Durable disk store.
//!
//! One record file per key, sharded by the first two hex digits of the key's
//! SHA-256: `<root>/ab/ab12...ef.asset`. Writes go to a temp file that is renamed
//! into place, so a reader never sees a half-written record.
//!
//! Record layout:
//!
//! ```text
//! 0..4    magic "ACE1"
//! 4       flags (bit 0: payload is zstd)
//! 5..13   last_accessed_at, unix millis, i64 LE   (rewritten in place by touch)
//! 13..17  metadata length, u32 LE
//! 17..    metadata JSON
//! ..      payload
//! ```

use std::collections::HashMap;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::RwLock;
use tokio::task;
use tracing::{debug, info, warn};

use crate::cache::compressor::{CompressionError, Compressor, EncodedPayload};
use crate::cache::entry::{CacheEntry, EntryMetadata, VersionTag};
use crate::config::{CompressionConfig, StoreConfig};
use crate::store::{check_capacity, Store, StoreError};

const MAGIC: &[u8; 4] = b"ACE1";
const FLAG_ZSTD: u8 = 0x01;
const ACCESS_OFFSET: u64 = 5;
const FIXED_HEADER_LEN: usize = 17;
const RECORD_EXT: &str = "asset";
const TMP_EXT: &str = "tmp";

/// Metadata as persisted in the record. `last_accessed_at` lives in the fixed header.
#[derive(Debug, Serialize, Deserialize)]
struct StoredMetadata {
    key: String,
    size_bytes: u64,
    stored_at: DateTime<Utc>,
    version_tag: VersionTag,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    content_type: Option<String>,
}

impl StoredMetadata {
    fn from_meta(meta: &EntryMetadata) -> Self {
        Self {
            key: meta.key.clone(),
            size_bytes: meta.size_bytes,
            stored_at: meta.stored_at,
            version_tag: meta.version_tag.clone(),
            content_type: meta.content_type.clone(),
        }
    }

    fn into_meta(self, last_accessed_at: DateTime<Utc>) -> EntryMetadata {
        EntryMetadata {
            key: self.key,
            size_bytes: self.size_bytes,
            stored_at: self.stored_at,
            last_accessed_at,
            version_tag: self.version_tag,
            content_type: self.content_type,
        }
    }
}

/// Parsed fixed header.
struct FixedHeader {
    flags: u8,
    last_accessed_at: DateTime<Utc>,
    metadata_len: usize,
}

fn corrupt(path: &Path, reason: impl Into<String>) -> StoreError {
    StoreError::Corrupt {
        location: path.display().to_string(),
        reason: reason.into(),
    }
}

/// Access times are persisted at millisecond precision; keep the index identical.
fn truncate_to_millis(at: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(at.timestamp_millis()).unwrap_or(at)
}

fn parse_fixed_header(path: &Path, buf: &mut Bytes) -> Result<FixedHeader, StoreError> {
    if buf.len() < FIXED_HEADER_LEN {
        return Err(corrupt(path, "truncated fixed header"));
    }
    let magic = buf.split_to(MAGIC.len());
    if &magic[..] != MAGIC {
        return Err(corrupt(path, "bad magic"));
    }
    let flags = buf.get_u8();
    let millis = buf.get_i64_le();
    let metadata_len = buf.get_u32_le() as usize;
    let last_accessed_at = DateTime::<Utc>::from_timestamp_millis(millis)
        .ok_or_else(|| corrupt(path, "access time out of range"))?;
    Ok(FixedHeader {
        flags,
        last_accessed_at,
        metadata_len,
    })
}

fn parse_metadata(path: &Path, raw: &[u8]) -> Result<StoredMetadata, StoreError> {
    serde_json::from_slice(raw).map_err(|e| corrupt(path, format!("metadata: {e}")))
}

fn encode_record(meta: &EntryMetadata, payload: &EncodedPayload) -> Result<Bytes, StoreError> {
    let metadata = serde_json::to_vec(&StoredMetadata::from_meta(meta))?;
    let flags = if payload.compressed { FLAG_ZSTD } else { 0 };

    let mut buf = BytesMut::with_capacity(FIXED_HEADER_LEN + metadata.len() + payload.data.len());
    buf.put_slice(MAGIC);
    buf.put_u8(flags);
    buf.put_i64_le(meta.last_accessed_at.timestamp_millis());
    buf.put_u32_le(metadata.len() as u32);
    buf.put_slice(&metadata);
    buf.put_slice(&payload.data);
    Ok(buf.freeze())
}

/// Read just the fixed header and metadata of a record, without the payload.
async fn read_record_metadata(path: &Path) -> Result<EntryMetadata, StoreError> {
    let mut file = fs::File::open(path).await?;
    let file_len = file.metadata().await?.len();

    let mut fixed = vec![0u8; FIXED_HEADER_LEN];
    file.read_exact(&mut fixed)
        .await
        .map_err(|_| corrupt(path, "truncated fixed header"))?;
    let header = parse_fixed_header(path, &mut Bytes::from(fixed))?;

    let prefix_len = (FIXED_HEADER_LEN + header.metadata_len) as u64;
    if prefix_len > file_len {
        return Err(corrupt(path, "metadata overruns record"));
    }

    let mut raw = vec![0u8; header.metadata_len];
    file.read_exact(&mut raw)
        .await
        .map_err(|_| corrupt(path, "truncated metadata"))?;
    let stored = parse_metadata(path, &raw)?;

    let payload_len = file_len - prefix_len;
    if header.flags & FLAG_ZSTD == 0 && payload_len != stored.size_bytes {
        return Err(corrupt(
            path,
            format!("payload is {payload_len} bytes, expected {}", stored.size_bytes),
        ));
    }

    Ok(stored.into_meta(header.last_accessed_at))
}

#[derive(Debug, Default)]
struct Index {
    entries: HashMap<String, EntryMetadata>,
    total_bytes: u64,

    /// Bytes claimed by puts whose record is still being written.
    reserved_bytes: u64,
}

impl Index {
    fn insert(&mut self, meta: EntryMetadata) -> Option<EntryMetadata> {
        self.total_bytes += meta.size_bytes;
        let previous = self.entries.insert(meta.key.clone(), meta);
        if let Some(ref prev) = previous {
            self.total_bytes = self.total_bytes.saturating_sub(prev.size_bytes);
        }
        previous
    }

    fn remove(&mut self, key: &str) -> Option<EntryMetadata> {
        let removed = self.entries.remove(key);
        if let Some(ref meta) = removed {
            self.total_bytes = self.total_bytes.saturating_sub(meta.size_bytes);
        }
        removed
    }
}

/// Durable store backed by one record file per key.
pub struct DiskStore {
    root: PathBuf,

    /// fsync writes before reporting success.
    fsync: bool,

    /// Engine-level hard capacity.
    capacity_bytes: Option<u64>,

    compressor: Compressor,

    /// In-memory view of every record's metadata, rebuilt on open.
    index: RwLock<Index>,
}

impl DiskStore {
    /// Open (or create) a store rooted at `config.root` and rebuild its index.
    pub async fn open(
        config: StoreConfig,
        compression: CompressionConfig,
    ) -> Result<Self, StoreError> {
        fs::create_dir_all(&config.root).await?;

        let store = Self {
            root: config.root,
            fsync: config.fsync,
            capacity_bytes: config.capacity_bytes,
            compressor: Compressor::new(compression),
            index: RwLock::new(Index::default()),
        };

        let dropped = store.rebuild_index().await?;
        let index = store.index.read().await;
        info!(
            root = %store.root.display(),
            entries = index.entries.len(),
            bytes = index.total_bytes,
            dropped,
            "Disk store opened"
        );
        drop(index);

        Ok(store)
    }

    /// File path for a key's record.
    pub fn record_path(&self, key: &str) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(key.as_bytes());
        let hash = hex::encode(hasher.finalize());
        self.root
            .join(&hash[..2])
            .join(format!("{hash}.{RECORD_EXT}"))
    }

    /// Scan every shard, index readable records and delete the rest.
    /// Returns how many files were dropped.
    async fn rebuild_index(&self) -> Result<usize, StoreError> {
        let mut index = Index::default();
        let mut dropped = 0;

        let mut shards = fs::read_dir(&self.root).await?;
        while let Some(shard) = shards.next_entry().await? {
            if !shard.file_type().await?.is_dir() {
                continue;
            }
            let mut files = fs::read_dir(shard.path()).await?;
            while let Some(file) = files.next_entry().await? {
                let path = file.path();
                match path.extension().and_then(|e| e.to_str()) {
                    Some(TMP_EXT) => {
                        // Left over from an interrupted write.
                        let _ = fs::remove_file(&path).await;
                        continue;
                    }
                    Some(RECORD_EXT) => {}
                    _ => continue,
                }

                match read_record_metadata(&path).await {
                    Ok(meta) if self.record_path(&meta.key) == path => {
                        index.insert(meta);
                    }
                    Ok(meta) => {
                        warn!(path = %path.display(), key = %meta.key, "Record stored under wrong path, dropping");
                        let _ = fs::remove_file(&path).await;
                        dropped += 1;
                    }
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Dropping unreadable record");
                        let _ = fs::remove_file(&path).await;
                        dropped += 1;
                    }
                }
            }
        }

        *self.index.write().await = index;
        Ok(dropped)
    }

    /// Encode and write one record. Returns its on-disk length.
    async fn write_record(&self, meta: &EntryMetadata, bytes: Bytes) -> Result<usize, StoreError> {
        let payload = self.encode_payload(bytes).await?;
        let record = encode_record(meta, &payload)?;
        let path = self.record_path(&meta.key);
        self.write_atomic(&path, &record).await?;

        debug!(
            key = %meta.key,
            path = %path.display(),
            size = meta.size_bytes,
            on_disk = record.len(),
            compressed = payload.compressed,
            "Wrote record"
        );
        Ok(record.len())
    }

    /// Write `data` to a temp file beside `path`, then rename it over `path`.
    async fn write_atomic(&self, path: &Path, data: &[u8]) -> Result<(), StoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let tmp = path.with_extension(format!("{RECORD_EXT}.{}.{TMP_EXT}", uuid::Uuid::new_v4()));
        let result = async {
            let mut file = fs::File::create(&tmp).await?;
            file.write_all(data).await?;
            file.flush().await?;
            if self.fsync {
                file.sync_all().await?;
            }
            drop(file);
            fs::rename(&tmp, path).await
        }
        .await;

        if let Err(e) = result {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    /// zstd runs on the blocking pool; raw payloads pass straight through.
    async fn encode_payload(&self, bytes: Bytes) -> Result<EncodedPayload, StoreError> {
        if !self.compressor.is_enabled() {
            return Ok(self.compressor.encode(&bytes)?);
        }
        let compressor = self.compressor.clone();
        let payload = task::spawn_blocking(move || compressor.encode(&bytes))
            .await
            .map_err(io::Error::from)??;
        Ok(payload)
    }

    async fn decode_payload(
        &self,
        path: &Path,
        payload: Bytes,
        compressed: bool,
        expected_size: u64,
    ) -> Result<Bytes, StoreError> {
        let result = if compressed {
            let compressor = self.compressor.clone();
            task::spawn_blocking(move || compressor.decode(payload, true, expected_size))
                .await
                .map_err(io::Error::from)?
        } else {
            self.compressor.decode(payload, false, expected_size)
        };

        result.map_err(|e| match e {
            CompressionError::SizeMismatch { .. } => corrupt(path, e.to_string()),
            other => StoreError::Compression(other),
        })
    }

    async fn decode(&self, path: &Path, key: &str, data: Bytes) -> Result<CacheEntry, StoreError> {
        let mut buf = data;
        let header = parse_fixed_header(path, &mut buf)?;
        if buf.len() < header.metadata_len {
            return Err(corrupt(path, "truncated metadata"));
        }
        let raw = buf.split_to(header.metadata_len);
        let stored = parse_metadata(path, &raw)?;
        if stored.key != key {
            return Err(corrupt(path, format!("record holds key {:?}", stored.key)));
        }

        let compressed = header.flags & FLAG_ZSTD != 0;
        let bytes = self
            .decode_payload(path, buf, compressed, stored.size_bytes)
            .await?;

        Ok(CacheEntry {
            meta: stored.into_meta(header.last_accessed_at),
            bytes,
        })
    }

    /// Remove a key's file, then its index entry. A missing file is fine; any
    /// other failure leaves the entry indexed.
    async fn discard(&self, key: &str, path: &Path) -> Result<Option<EntryMetadata>, StoreError> {
        let mut index = self.index.write().await;
        match fs::remove_file(path).await {
            Ok(()) => debug!(key = %key, path = %path.display(), "Deleted record file"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to delete record file");
                return Err(e.into());
            }
        }
        Ok(index.remove(key))
    }
}

#[async_trait]
impl Store for DiskStore {
    async fn put(&self, entry: CacheEntry) -> Result<(), StoreError> {
        if !entry.is_consistent() {
            return Err(StoreError::Corrupt {
                location: entry.key().to_string(),
                reason: format!(
                    "size_bytes {} does not match payload length {}",
                    entry.size_bytes(),
                    entry.bytes.len()
                ),
            });
        }

        let mut meta = entry.meta;
        meta.last_accessed_at = truncate_to_millis(meta.last_accessed_at);
        let incoming = meta.size_bytes;

        // Reserve before writing so concurrent puts cannot both fit in the same headroom.
        {
            let mut index = self.index.write().await;
            let replaced = index.entries.get(&meta.key).map(|m| m.size_bytes).unwrap_or(0);
            let committed = index.total_bytes + index.reserved_bytes;
            check_capacity(self.capacity_bytes, committed, replaced, incoming)?;
            index.reserved_bytes += incoming;
        }

        let written = self.write_record(&meta, entry.bytes).await;

        let mut index = self.index.write().await;
        index.reserved_bytes = index.reserved_bytes.saturating_sub(incoming);
        written?;
        index.insert(meta);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, StoreError> {
        if !self.index.read().await.entries.contains_key(key) {
            return Ok(None);
        }

        let path = self.record_path(key);
        let data = match fs::read(&path).await {
            Ok(data) => Bytes::from(data),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(key = %key, "Record file vanished, dropping index entry");
                self.index.write().await.remove(key);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        match self.decode(&path, key, data).await {
            Ok(entry) => Ok(Some(entry)),
            Err(e @ (StoreError::Corrupt { .. } | StoreError::Compression(_))) => {
                warn!(key = %key, error = %e, "Corrupt record, discarding");
                if let Err(discard_err) = self.discard(key, &path).await {
                    warn!(key = %key, error = %discard_err, "Could not discard corrupt record");
                }
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    async fn metadata(&self, key: &str) -> Result<Option<EntryMetadata>, StoreError> {
        Ok(self.index.read().await.entries.get(key).cloned())
    }

    async fn touch(&self, key: &str, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let at = truncate_to_millis(at);
        if !self.index.read().await.entries.contains_key(key) {
            return Ok(false);
        }

        let path = self.record_path(key);
        let result = async {
            let mut file = OpenOptions::new().write(true).open(&path).await?;
            file.seek(SeekFrom::Start(ACCESS_OFFSET)).await?;
            file.write_all(&at.timestamp_millis().to_le_bytes()).await?;
            file.flush().await?;
            if self.fsync {
                file.sync_data().await?;
            }
            Ok::<_, io::Error>(())
        }
        .await;

        // The index follows the file, never leads it.
        match result {
            Ok(()) => {
                let mut index = self.index.write().await;
                match index.entries.get_mut(key) {
                    Some(meta) => {
                        meta.last_accessed_at = at;
                        Ok(true)
                    }
                    None => Ok(false),
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                self.index.write().await.remove(key);
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let path = self.record_path(key);
        Ok(self.discard(key, &path).await?.is_some())
    }

    async fn list_keys(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.index.read().await.entries.keys().cloned().collect())
    }

    async fn list_metadata(&self) -> Result<Vec<EntryMetadata>, StoreError> {
        Ok(self.index.read().await.entries.values().cloned().collect())
    }

    async fn total_size(&self) -> Result<u64, StoreError> {
        Ok(self.index.read().await.total_bytes)
    }

    /// Removes every record it can. If any file cannot be deleted, those keys
    /// stay indexed and the first failure is returned.
    async fn clear(&self) -> Result<usize, StoreError> {
        let mut index = self.index.write().await;
        let keys: Vec<String> = index.entries.keys().cloned().collect();

        let mut removed = 0;
        let mut first_error = None;
        for key in keys {
            let path = self.record_path(&key);
            match fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(key = %key, error = %e, "Failed to delete record file during clear");
                    first_error.get_or_insert(e);
                    continue;
                }
            }
            index.remove(&key);
            removed += 1;
        }
        let remaining = index.entries.len();
        drop(index);

        if let Some(e) = first_error {
            warn!(removed, remaining, "Disk store partially cleared");
            return Err(e.into());
        }
        info!(removed, "Disk store cleared");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store_config(root: &Path) -> StoreConfig {
        StoreConfig {
            root: root.to_path_buf(),
            fsync: false,
            ..Default::default()
        }
    }

    fn entry(key: &str, data: Vec<u8>) -> CacheEntry {
        CacheEntry::new(
            key,
            Bytes::from(data),
            VersionTag::new("\"v1\""),
            Some("image/png".to_string()),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_write_and_read_record() {
        let tmp = TempDir::new().unwrap();
        let store = DiskStore::open(store_config(tmp.path()), CompressionConfig::default())
            .await
            .unwrap();

        let data = vec![42u8; 4096];
        store.put(entry("https://cdn/a.png", data.clone())).await.unwrap();
        assert!(store.record_path("https://cdn/a.png").exists());

        let read = store.get("https://cdn/a.png").await.unwrap().unwrap();
        assert_eq!(&read.bytes[..], &data[..]);
        assert_eq!(read.meta.content_type.as_deref(), Some("image/png"));
        assert_eq!(store.total_size().await.unwrap(), 4096);
    }

    #[tokio::test]
    async fn test_delete_record() {
        let tmp = TempDir::new().unwrap();
        let store = DiskStore::open(store_config(tmp.path()), CompressionConfig::default())
            .await
            .unwrap();

        store.put(entry("k", vec![1u8; 1024])).await.unwrap();
        assert!(store.delete("k").await.unwrap());
        assert!(!store.delete("k").await.unwrap());
        assert!(store.get("k").await.unwrap().is_none());
        assert!(!store.record_path("k").exists());
    }

    #[tokio::test]
    async fn test_reopen_restores_index_and_access_time() {
        let tmp = TempDir::new().unwrap();
        let touched_at = Utc::now() + chrono::Duration::minutes(5);
        {
            let store = DiskStore::open(store_config(tmp.path()), CompressionConfig::default())
                .await
                .unwrap();
            store.put(entry("a", vec![1u8; 100])).await.unwrap();
            store.put(entry("b", vec![2u8; 200])).await.unwrap();
            assert!(store.touch("a", touched_at).await.unwrap());
        }

        let store = DiskStore::open(store_config(tmp.path()), CompressionConfig::default())
            .await
            .unwrap();
        assert_eq!(store.total_size().await.unwrap(), 300);

        let meta = store.metadata("a").await.unwrap().unwrap();
        assert_eq!(meta.last_accessed_at, truncate_to_millis(touched_at));

        let b = store.get("b").await.unwrap().unwrap();
        assert_eq!(&b.bytes[..], &[2u8; 200][..]);
    }

    #[tokio::test]
    async fn test_corrupt_record_dropped_on_open() {
        let tmp = TempDir::new().unwrap();
        let path = {
            let store = DiskStore::open(store_config(tmp.path()), CompressionConfig::default())
                .await
                .unwrap();
            store.put(entry("good", vec![1u8; 10])).await.unwrap();
            store.put(entry("bad", vec![2u8; 500])).await.unwrap();
            store.record_path("bad")
        };

        // Truncate the payload.
        let data = std::fs::read(&path).unwrap();
        std::fs::write(&path, &data[..data.len() - 100]).unwrap();

        let store = DiskStore::open(store_config(tmp.path()), CompressionConfig::default())
            .await
            .unwrap();
        assert!(store.metadata("good").await.unwrap().is_some());
        assert!(store.metadata("bad").await.unwrap().is_none());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_compressed_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let compression = CompressionConfig {
            enabled: true,
            zstd_level: 3,
        };
        let store = DiskStore::open(store_config(tmp.path()), compression).await.unwrap();

        let data = vec![7u8; 64 * 1024];
        store.put(entry("big", data.clone())).await.unwrap();

        let on_disk = std::fs::metadata(store.record_path("big")).unwrap().len();
        assert!(on_disk < data.len() as u64);

        let read = store.get("big").await.unwrap().unwrap();
        assert_eq!(read.size_bytes(), data.len() as u64);
        assert_eq!(&read.bytes[..], &data[..]);
    }

    #[tokio::test]
    async fn test_engine_capacity() {
        let tmp = TempDir::new().unwrap();
        let config = StoreConfig {
            capacity_bytes: Some(1000),
            ..store_config(tmp.path())
        };
        let store = DiskStore::open(config, CompressionConfig::default()).await.unwrap();

        store.put(entry("a", vec![0u8; 900])).await.unwrap();
        let err = store.put(entry("b", vec![0u8; 200])).await.unwrap_err();
        assert!(matches!(err, StoreError::QuotaExceeded { .. }));
        assert!(!store.record_path("b").exists());
    }

    #[tokio::test]
    async fn test_concurrent_puts_respect_capacity() {
        let tmp = TempDir::new().unwrap();
        let config = StoreConfig {
            capacity_bytes: Some(1000),
            ..store_config(tmp.path())
        };
        let store = DiskStore::open(config, CompressionConfig::default()).await.unwrap();

        let (a, b) = tokio::join!(
            store.put(entry("a", vec![1u8; 600])),
            store.put(entry("b", vec![2u8; 600])),
        );

        assert_eq!([a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count(), 1);
        let rejected = if a.is_err() { a } else { b };
        assert!(matches!(rejected.unwrap_err(), StoreError::QuotaExceeded { .. }));
        assert_eq!(store.total_size().await.unwrap(), 600);
        assert_eq!(store.list_keys().await.unwrap().len(), 1);
    }

    /// Replace a record file with a directory so unlink and open-for-write fail.
    fn block_record(path: &Path) {
        std::fs::remove_file(path).unwrap();
        std::fs::create_dir(path).unwrap();
    }

    #[tokio::test]
    async fn test_failed_delete_keeps_index_entry() {
        let tmp = TempDir::new().unwrap();
        let store = DiskStore::open(store_config(tmp.path()), CompressionConfig::default())
            .await
            .unwrap();
        store.put(entry("k", vec![1u8; 256])).await.unwrap();
        block_record(&store.record_path("k"));

        assert!(store.delete("k").await.is_err());
        assert!(store.metadata("k").await.unwrap().is_some());
        assert_eq!(store.total_size().await.unwrap(), 256);
    }

    #[tokio::test]
    async fn test_clear_reports_undeletable_records() {
        let tmp = TempDir::new().unwrap();
        let store = DiskStore::open(store_config(tmp.path()), CompressionConfig::default())
            .await
            .unwrap();
        store.put(entry("stuck", vec![1u8; 100])).await.unwrap();
        store.put(entry("free", vec![2u8; 50])).await.unwrap();
        block_record(&store.record_path("stuck"));

        assert!(store.clear().await.is_err());
        assert_eq!(store.list_keys().await.unwrap(), vec!["stuck".to_string()]);
        assert_eq!(store.total_size().await.unwrap(), 100);
        assert!(!store.record_path("free").exists());
    }

    #[tokio::test]
    async fn test_failed_touch_leaves_access_time() {
        let tmp = TempDir::new().unwrap();
        let store = DiskStore::open(store_config(tmp.path()), CompressionConfig::default())
            .await
            .unwrap();
        store.put(entry("k", vec![1u8; 64])).await.unwrap();
        let before = store.metadata("k").await.unwrap().unwrap().last_accessed_at;
        block_record(&store.record_path("k"));

        let later = Utc::now() + chrono::Duration::minutes(10);
        assert!(store.touch("k", later).await.is_err());
        let after = store.metadata("k").await.unwrap().unwrap().last_accessed_at;
        assert_eq!(after, before);
    }

    #[tokio::test]
    async fn test_touch_unknown_key() {
        let tmp = TempDir::new().unwrap();
        let store = DiskStore::open(store_config(tmp.path()), CompressionConfig::default())
            .await
            .unwrap();
        assert!(!store.touch("missing", Utc::now()).await.unwrap());
    }

    #[tokio::test]
    async fn test_oversized_metadata_length_dropped_on_open() {
        let tmp = TempDir::new().unwrap();
        let shard = tmp.path().join("ab");
        std::fs::create_dir_all(&shard).unwrap();
        let path = shard.join(format!("ab00.{RECORD_EXT}"));

        let mut record = Vec::new();
        record.extend_from_slice(MAGIC);
        record.push(0);
        record.extend_from_slice(&0i64.to_le_bytes());
        record.extend_from_slice(&u32::MAX.to_le_bytes());
        record.extend_from_slice(b"{}xx");
        std::fs::write(&path, &record).unwrap();

        let store = DiskStore::open(store_config(tmp.path()), CompressionConfig::default())
            .await
            .unwrap();
        assert!(!path.exists());
        assert!(store.list_keys().await.unwrap().is_empty());
        assert_eq!(store.total_size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_compressed_record_corrupted_in_place() {
        let tmp = TempDir::new().unwrap();
        let compression = CompressionConfig {
            enabled: true,
            zstd_level: 3,
        };
        let store = DiskStore::open(store_config(tmp.path()), compression).await.unwrap();
        store.put(entry("z", vec![9u8; 32 * 1024])).await.unwrap();

        let path = store.record_path("z");
        let mut data = std::fs::read(&path).unwrap();
        let len = data.len();
        data.truncate(len - 4);
        std::fs::write(&path, &data).unwrap();

        assert!(store.get("z").await.is_err());
        assert!(store.metadata("z").await.unwrap().is_none());
        assert!(!path.exists());
    }
}
