//! Upstream fetching.
//!
//! The cache never talks to the network itself. Consumers hand it a [`Fetcher`]
//! per request, which decouples the cache from any particular transport.
//!
//! - [`http`]: reqwest-backed fetcher that treats keys as URLs

pub mod http;

use std::future::Future;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::cache::entry::VersionTag;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("Transport error fetching {key}: {message}")]
    Transport { key: String, message: String },

    #[error("Upstream returned status {status} for {key}")]
    Status { key: String, status: u16 },

    #[error("Fetch for {key} was aborted")]
    Aborted { key: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Raw upstream response: payload plus the response headers.
#[derive(Debug, Clone, Default)]
pub struct FetchedAsset {
    pub bytes: Bytes,
    pub headers: Vec<(String, String)>,
}

impl FetchedAsset {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self {
            bytes: bytes.into(),
            headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Outcome of a lightweight remote version check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Revalidation {
    /// Upstream still has the cached version.
    Unchanged,
    /// Upstream has a different version.
    Changed,
    /// This fetcher or this tag cannot be checked remotely.
    Unsupported,
}

/// Network fetch strategy supplied by a consumer.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetch the full payload for `key`.
    async fn fetch(&self, key: &str) -> Result<FetchedAsset, FetchError>;

    /// Check whether `version` is still current upstream.
    async fn revalidate(
        &self,
        _key: &str,
        _version: &VersionTag,
    ) -> Result<Revalidation, FetchError> {
        Ok(Revalidation::Unsupported)
    }
}

/// Any `Fn(String) -> impl Future<Output = Result<FetchedAsset, FetchError>>` is a fetcher.
#[async_trait]
impl<F, Fut> Fetcher for F
where
    F: Fn(String) -> Fut + Send + Sync,
    Fut: Future<Output = Result<FetchedAsset, FetchError>> + Send + 'static,
{
    async fn fetch(&self, key: &str) -> Result<FetchedAsset, FetchError> {
        (self)(key.to_string()).await
    }
}
