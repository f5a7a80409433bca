//! Cache entry types.
//!
//! An entry is the unit of storage and eviction: one key, its payload, and the
//! metadata the evictor and staleness policy work from.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::fetch::FetchedAsset;

/// Prefix marking a version tag derived from content rather than an upstream validator.
const CONTENT_HASH_PREFIX: &str = "sha256:";

/// Opaque version identifier for a cached payload.
///
/// Either a strong `ETag` supplied by the upstream or a SHA-256 of the content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionTag(String);

impl VersionTag {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    /// Use an `ETag` value if it is a strong validator. Weak tags (`W/"..."`) are rejected.
    pub fn from_etag(etag: &str) -> Option<Self> {
        let etag = etag.trim();
        if etag.is_empty() || etag.starts_with("W/") {
            return None;
        }
        Some(Self(etag.to_string()))
    }

    pub fn content_hash(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self(format!("{CONTENT_HASH_PREFIX}{}", hex::encode(hasher.finalize())))
    }

    /// Whether this tag came from the upstream and can be sent back in a conditional request.
    pub fn is_upstream_validator(&self) -> bool {
        !self.0.starts_with(CONTENT_HASH_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for VersionTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything about an entry except its payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMetadata {
    /// Stable identifier, typically the source URL.
    pub key: String,

    /// Payload length in bytes (uncompressed).
    pub size_bytes: u64,

    /// When the payload was fetched and stored.
    pub stored_at: DateTime<Utc>,

    /// Last time the entry was served.
    pub last_accessed_at: DateTime<Utc>,

    pub version_tag: VersionTag,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

/// A cached payload together with its metadata.
///
/// Invariant: `meta.size_bytes == bytes.len()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub meta: EntryMetadata,
    pub bytes: Bytes,
}

impl CacheEntry {
    /// Create a new entry stored and accessed at `now`.
    pub fn new(
        key: impl Into<String>,
        bytes: Bytes,
        version_tag: VersionTag,
        content_type: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            meta: EntryMetadata {
                key: key.into(),
                size_bytes: bytes.len() as u64,
                stored_at: now,
                last_accessed_at: now,
                version_tag,
                content_type,
            },
            bytes,
        }
    }

    /// Build an entry from a raw upstream response.
    ///
    /// The version tag is the response's strong `ETag` when present, otherwise a content hash.
    pub fn from_fetch(key: impl Into<String>, asset: FetchedAsset, now: DateTime<Utc>) -> Self {
        let version_tag = asset
            .header("etag")
            .and_then(VersionTag::from_etag)
            .unwrap_or_else(|| VersionTag::content_hash(&asset.bytes));
        let content_type = asset.header("content-type").map(str::to_string);
        Self::new(key, asset.bytes, version_tag, content_type, now)
    }

    /// Override both timestamps. Used when backfilling or re-stamping entries.
    pub fn with_times(mut self, stored_at: DateTime<Utc>, last_accessed_at: DateTime<Utc>) -> Self {
        self.meta.stored_at = stored_at;
        self.meta.last_accessed_at = last_accessed_at;
        self
    }

    pub fn key(&self) -> &str {
        &self.meta.key
    }

    pub fn size_bytes(&self) -> u64 {
        self.meta.size_bytes
    }

    /// Whether the recorded size matches the payload.
    pub fn is_consistent(&self) -> bool {
        self.meta.size_bytes == self.bytes.len() as u64
    }
}
