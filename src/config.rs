//! Runtime configuration for asset-cache.
//!
//! Configuration can be loaded from a JSON file or constructed programmatically.
//! All cache knobs (store location, quota bounds, staleness, compression, sweeping) live here.

use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "asset-cache", about = "Persistent asset cache with an HTTP front")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// HTTP listen address (overrides `server.listen`).
    #[arg(long)]
    pub listen: Option<String>,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server configuration.
    pub server: ServerConfig,

    /// Persistence layer configuration.
    pub store: StoreConfig,

    /// Quota bounds enforced by the evictor.
    pub quota: QuotaConfig,

    /// When cached entries are considered stale.
    pub staleness: StalenessConfig,

    /// On-disk payload compression.
    pub compression: CompressionConfig,

    /// Background quota sweeping.
    pub sweeper: SweeperConfig,

    /// Upstream fetch settings.
    pub fetch: FetchConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address (e.g. "0.0.0.0:8080").
    pub listen: String,

    /// How long an asset request may wait for its fetch before answering 504.
    /// The fetch itself keeps running and still fills the cache.
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8080".to_string(),
            request_timeout_secs: 60,
        }
    }
}

/// Which persistence backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// One record file per key under `root`.
    Disk,
    /// Process-local map; nothing survives a restart.
    Memory,
}

/// Persistence layer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,

    /// Root directory for disk records.
    pub root: PathBuf,

    /// fsync records and access-time updates before reporting success.
    pub fsync: bool,

    /// Hard capacity of the storage engine in bytes. Writes beyond it fail
    /// with `StoreError::QuotaExceeded`. `None` = limited only by the filesystem.
    pub capacity_bytes: Option<u64>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Disk,
            root: PathBuf::from("asset-cache"),
            fsync: true,
            capacity_bytes: None,
        }
    }
}

/// Quota bounds. A bound of 0 disables it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    /// Maximum total payload bytes across all entries.
    pub max_bytes: u64,

    /// Maximum number of entries.
    pub max_entries: usize,

    /// Entries not accessed for this long are purged by the sweeper.
    pub idle_ttl_secs: Option<u64>,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            max_bytes: 256 * 1024 * 1024, // 256 MB
            max_entries: 4096,
            idle_ttl_secs: None,
        }
    }
}

/// Staleness policy settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StalenessConfig {
    /// Entries older than this (since `stored_at`) are stale. `None` = never.
    pub max_age_secs: Option<u64>,

    /// Ask the fetcher whether the upstream version changed before serving a cached entry.
    pub version_check: bool,
}

/// Compression applied to payloads written by the disk store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    /// Apply zstd compression when writing records.
    pub enabled: bool,

    /// zstd compression level (1-22).
    pub zstd_level: i32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        // Most cached media (PNG, JPEG, WebP, Ogg) is already compressed.
        Self {
            enabled: false,
            zstd_level: 3,
        }
    }
}

/// Background sweeper settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SweeperConfig {
    pub enabled: bool,

    /// Seconds between sweeps.
    pub interval_secs: u64,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 300,
        }
    }
}

/// Upstream HTTP fetch settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Whole-request timeout in seconds.
    pub timeout_secs: u64,

    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            user_agent: format!("asset-cache/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert_eq!(cfg.quota.max_bytes, 256 * 1024 * 1024);
        assert_eq!(cfg.store.backend, StoreBackend::Disk);
        assert_eq!(cfg.staleness.max_age_secs, None);
        assert!(!cfg.staleness.version_check);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let json = r#"{
            "store": { "backend": "memory" },
            "quota": { "max_bytes": 1000 },
            "staleness": { "max_age_secs": 86400 }
        }"#;
        let cfg: Config = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.store.backend, StoreBackend::Memory);
        assert!(cfg.store.fsync);
        assert_eq!(cfg.quota.max_bytes, 1000);
        assert_eq!(cfg.quota.max_entries, 4096);
        assert_eq!(cfg.staleness.max_age_secs, Some(86400));
        assert_eq!(cfg.sweeper.interval_secs, 300);
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let cfg = Config::load(std::path::Path::new("/nonexistent/asset-cache.json")).unwrap();
        assert_eq!(cfg.server.listen, "127.0.0.1:8080");
    }
}
