//! HTTP fetcher: keys are absolute URLs.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{ETAG, IF_NONE_MATCH};
use reqwest::{Client, StatusCode};
use tracing::{debug, warn};

use crate::cache::entry::VersionTag;
use crate::config::FetchConfig;
use crate::fetch::{FetchError, FetchedAsset, Fetcher, Revalidation};

/// Fetches assets over HTTP(S) with reqwest.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    /// Create a new HTTP fetcher.
    pub fn new(config: &FetchConfig) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| FetchError::Internal(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }

    fn transport_error(key: &str, err: reqwest::Error) -> FetchError {
        FetchError::Transport {
            key: key.to_string(),
            message: err.to_string(),
        }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, key: &str) -> Result<FetchedAsset, FetchError> {
        debug!(url = %key, "Fetching asset");

        let response = self
            .client
            .get(key)
            .send()
            .await
            .map_err(|e| Self::transport_error(key, e))?;

        if !response.status().is_success() {
            warn!(status = %response.status(), url = %key, "Upstream fetch failed");
            return Err(FetchError::Status {
                key: key.to_string(),
                status: response.status().as_u16(),
            });
        }

        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        let bytes = response
            .bytes()
            .await
            .map_err(|e| Self::transport_error(key, e))?;

        debug!(url = %key, size = bytes.len(), "Fetched asset");

        Ok(FetchedAsset { bytes, headers })
    }

    /// Conditional `HEAD` with `If-None-Match`.
    async fn revalidate(&self, key: &str, version: &VersionTag) -> Result<Revalidation, FetchError> {
        if !version.is_upstream_validator() {
            return Ok(Revalidation::Unsupported);
        }

        let response = self
            .client
            .head(key)
            .header(IF_NONE_MATCH, version.as_str())
            .send()
            .await
            .map_err(|e| Self::transport_error(key, e))?;

        let status = response.status();
        if status == StatusCode::NOT_MODIFIED {
            return Ok(Revalidation::Unchanged);
        }
        if !status.is_success() {
            return Err(FetchError::Status {
                key: key.to_string(),
                status: status.as_u16(),
            });
        }

        // Some servers ignore conditional HEADs and answer 200; compare the tag instead.
        let current = response.headers().get(ETAG).and_then(|v| v.to_str().ok());
        match current {
            Some(tag) if tag.trim() == version.as_str() => Ok(Revalidation::Unchanged),
            Some(_) => Ok(Revalidation::Changed),
            None => Ok(Revalidation::Unsupported),
        }
    }
}
