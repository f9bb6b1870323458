//! `POST /api/v1/watch`: long-poll watch over one resource's chain.

use crate::watch::{self, ReadError, Step};
use crate::{unix_now, AppState};
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use chainwatch_types::{Envelope, ErrorCode, WatchError, WatchEventOptions, WatchResp};
use rusqlite::Connection;
use serde_json::Value;
use std::sync::Arc;
use tokio::time::{sleep, Instant};

/// Errors surfaced by the watch endpoint, rendered as an error envelope.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The request cannot be served.
    #[error(transparent)]
    Watch(#[from] WatchError),

    /// The server failed while reading the chain.
    #[error("internal server error: {0}")]
    Internal(String),
}

impl From<ReadError> for ApiError {
    fn from(err: ReadError) -> Self {
        match err {
            ReadError::Watch(e) => Self::Watch(e),
            ReadError::Store(e) => Self::Internal(e.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            ApiError::Watch(e @ WatchError::CursorExpired(_)) => (StatusCode::GONE, e.code()),
            ApiError::Watch(e) => (StatusCode::BAD_REQUEST, e.code()),
            ApiError::Internal(msg) => {
                tracing::error!(error = %msg, "watch request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, ErrorCode::Internal)
            }
        };

        let body: Envelope<()> = Envelope::error(code, self.to_string());
        (status, Json(body)).into_response()
    }
}

/// Handler for `POST /api/v1/watch`.
///
/// Cursor watches that find nothing are held: the chain is rescanned every
/// `loop_interval` until an event arrives or `hold_timeout` elapses, at
/// which point the response reports nothing watched and hands back a cursor
/// to resume from.
pub async fn watch_handler(
    Extension(state): Extension<Arc<AppState>>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<Json<Envelope<WatchResp>>, ApiError> {
    let Json(body) =
        payload.map_err(|e| WatchError::InvalidParams(format!("malformed body: {e}")))?;
    let opts = parse_options(&state, body)?;
    let key = state.registry.key_for(opts.resource)?.clone();

    tracing::debug!(
        resource = %opts.resource,
        cursor = %opts.cursor,
        start_from = opts.start_from,
        "watch request"
    );

    let deadline = Instant::now() + state.watch.hold_timeout;
    let batch_limit = state.watch.batch_limit;

    let mut step = {
        let (key, opts) = (key.clone(), opts.clone());
        run_blocking(&state, move |conn| {
            watch::begin(conn, &key, &opts, unix_now(), batch_limit)
        })
        .await?
    };

    let events = loop {
        match step {
            Step::Done(events) => break events,
            Step::Pending(resume) => {
                if Instant::now() >= deadline {
                    break resume.into_events(opts.resource);
                }
                sleep(state.watch.loop_interval).await;
                let (key, opts) = (key.clone(), opts.clone());
                step = run_blocking(&state, move |conn| {
                    watch::rescan(conn, &key, &opts, &resume, unix_now(), batch_limit)
                })
                .await?;
            }
        }
    };

    let resp = watch::build_response(&opts.cursor, opts.resource, events);
    tracing::debug!(
        resource = %opts.resource,
        watched = resp.bk_watched,
        events = resp.bk_events.len(),
        "watch response"
    );
    Ok(Json(Envelope::ok(resp)))
}

/// Resolves the resource tag before decoding the rest of the body so an
/// unknown type is reported as such rather than as a malformed body.
fn parse_options(state: &AppState, body: Value) -> Result<WatchEventOptions, ApiError> {
    let tag = body
        .get("resource")
        .and_then(Value::as_str)
        .ok_or_else(|| WatchError::InvalidParams("resource is required".to_string()))?;
    state.registry.key_for_tag(tag)?;

    serde_json::from_value(body)
        .map_err(|e| WatchError::InvalidParams(format!("malformed body: {e}")).into())
}

async fn run_blocking<F, T>(state: &AppState, f: F) -> Result<T, ApiError>
where
    F: FnOnce(&Connection) -> Result<T, ReadError> + Send + 'static,
    T: Send + 'static,
{
    let pool = state.pool.clone();
    tokio::task::spawn_blocking(move || {
        let conn = pool
            .get()
            .map_err(|e| ApiError::Internal(format!("db connection failed: {e}")))?;
        f(&conn).map_err(ApiError::from)
    })
    .await
    .map_err(|e| ApiError::Internal(format!("task join error: {e}")))?
}
