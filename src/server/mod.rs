//! HTTP server exposing the asset cache.
//!
//! - [`api`]: Route handlers and response types

pub mod api;

pub use api::{build_router, AppState};
