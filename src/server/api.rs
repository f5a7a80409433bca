//! Asset cache HTTP API.
//!
//! - GET /v1/assets?url=...
//! - DELETE /v1/assets?url=...
//! - POST /v1/cache/clear
//! - POST /v1/cache/evict
//! - GET /v1/cache/stats
//! - GET /health
//! - GET /metrics

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{Query, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::cache::evictor::EvictionReport;
use crate::cache::orchestrator::{CacheStats, Resolved, SharedCache};
use crate::config::Config;
use crate::fetch::{FetchError, Fetcher};
use crate::store::StoreError;

/// Application state shared across handlers.
pub struct AppState {
    pub cache: SharedCache,
    pub fetcher: Arc<dyn Fetcher>,
    pub config: Arc<Config>,
    pub start_time: Instant,
}

/// Build the axum router with all API routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/assets", get(get_asset).delete(delete_asset))
        .route("/v1/cache/clear", post(clear_cache))
        .route("/v1/cache/evict", post(evict))
        .route("/v1/cache/stats", get(cache_stats))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ─── Request/Response Types ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct AssetQuery {
    pub url: String,
}

#[derive(Debug, Serialize)]
pub struct InvalidateResponse {
    pub key: String,
    pub removed: bool,
}

#[derive(Debug, Serialize)]
pub struct ClearResponse {
    pub removed: usize,
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
    pub cache: CacheStats,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Handler error rendered as a JSON body.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorResponse { error: self.message })).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        error!(error = %e, "Store operation failed");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    }
}

impl From<FetchError> for ApiError {
    fn from(e: FetchError) -> Self {
        let status = match e {
            FetchError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_GATEWAY,
        };
        Self::new(status, e.to_string())
    }
}

// ─── Route Handlers ────────────────────────────────────────────────────────

async fn get_asset(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AssetQuery>,
) -> Result<Response, ApiError> {
    if query.url.is_empty() {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "missing url"));
    }

    let request_id = Uuid::new_v4().to_string();
    let started = Instant::now();
    info!(request_id = request_id, key = query.url, "Asset request");

    let resolve = state.cache.resolve_with(&query.url, Arc::clone(&state.fetcher));
    let result = match state.config.server.request_timeout_secs {
        0 => resolve.await,
        secs => match tokio::time::timeout(Duration::from_secs(secs), resolve).await {
            Ok(result) => result,
            Err(_) => {
                warn!(request_id = request_id, key = query.url, "Asset request timed out");
                return Err(ApiError::new(
                    StatusCode::GATEWAY_TIMEOUT,
                    format!("timed out waiting for {}", query.url),
                ));
            }
        },
    };

    let resolved = result.inspect_err(|e| {
        warn!(request_id = request_id, key = query.url, error = %e, "Asset request failed");
    })?;

    info!(
        request_id = request_id,
        source = resolved.source.as_header_value(),
        size = resolved.bytes.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Asset served"
    );
    Ok(asset_response(resolved))
}

fn asset_response(resolved: Resolved) -> Response {
    let content_type = resolved
        .content_type
        .as_deref()
        .and_then(|ct| HeaderValue::from_str(ct).ok())
        .unwrap_or_else(|| HeaderValue::from_static("application/octet-stream"));
    let etag = resolved
        .version_tag
        .is_upstream_validator()
        .then(|| HeaderValue::from_str(resolved.version_tag.as_str()).ok())
        .flatten();

    let mut response = (StatusCode::OK, resolved.bytes).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, content_type);
    headers.insert("x-cache", HeaderValue::from_static(resolved.source.as_header_value()));
    if let Some(etag) = etag {
        headers.insert(header::ETAG, etag);
    }
    if let Some(warning) = &resolved.warning {
        headers.insert(header::WARNING, HeaderValue::from_static("110 - \"Response is Stale\""));
        headers.insert(header::AGE, HeaderValue::from(warning.age.as_secs()));
    }
    response
}

async fn delete_asset(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AssetQuery>,
) -> Result<Json<InvalidateResponse>, ApiError> {
    let removed = state.cache.invalidate(&query.url).await?;
    Ok(Json(InvalidateResponse {
        key: query.url,
        removed,
    }))
}

async fn clear_cache(State(state): State<Arc<AppState>>) -> Result<Json<ClearResponse>, ApiError> {
    let removed = state.cache.clear().await?;
    Ok(Json(ClearResponse { removed }))
}

async fn evict(State(state): State<Arc<AppState>>) -> Result<Json<EvictionReport>, ApiError> {
    Ok(Json(state.cache.enforce_quota().await?))
}

async fn cache_stats(State(state): State<Arc<AppState>>) -> Result<Json<CacheStats>, ApiError> {
    Ok(Json(state.cache.stats().await?))
}

async fn health(State(state): State<Arc<AppState>>) -> Result<Json<HealthResponse>, ApiError> {
    Ok(Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        cache: state.cache.stats().await?,
    }))
}

async fn metrics(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let body = state
        .cache
        .metrics()
        .encode()
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response())
}
