//! Chainwatch server library logic.
//!
//! Serves the watch protocol over the chain database: `POST /api/v1/watch`
//! answers one long-poll request for one resource type, and `GET /health`
//! reports liveness. The pool and the resource registry are built once by
//! the binary and shared read-only through [`AppState`].

pub mod api_watch;
pub mod config;
pub mod retention;
pub mod watch;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use chainwatch_db::DbPool;
use chainwatch_types::{ResourceRegistry, WATCH_PATH};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;

/// Timing and sizing of the watch endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchSettings {
    /// How long a cursor watch is held when nothing new is found.
    pub hold_timeout: Duration,
    /// Pause between scans while holding.
    pub loop_interval: Duration,
    /// Maximum chain nodes scanned per request.
    pub batch_limit: usize,
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self {
            hold_timeout: Duration::from_secs(20),
            loop_interval: Duration::from_millis(250),
            batch_limit: 200,
        }
    }
}

impl From<&config::WatchConfig> for WatchSettings {
    fn from(config: &config::WatchConfig) -> Self {
        Self {
            hold_timeout: Duration::from_secs(config.hold_timeout_secs),
            loop_interval: Duration::from_millis(config.loop_interval_ms),
            batch_limit: config.batch_limit.max(1),
        }
    }
}

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Chain database pool the watch endpoint reads through.
    pub pool: DbPool,
    /// Watchable resource types.
    pub registry: Arc<ResourceRegistry>,
    /// Watch endpoint tunables.
    pub watch: WatchSettings,
}

/// Current unix time in seconds.
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Watch requests are small JSON documents.
const MAX_REQUEST_BODY_BYTES: usize = 64 * 1024;

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Builds the application router with all routes.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(WATCH_PATH, post(api_watch::watch_handler))
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(Extension(Arc::new(state)))
}
