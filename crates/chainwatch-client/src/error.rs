//! Errors surfaced by the watch client.

use chainwatch_types::{ErrorCode, WatchError};
use thiserror::Error;

/// Errors returned by one poll of the watch loop.
///
/// None of them advance the loop's position, so the same request can be
/// retried safely.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The request never produced an HTTP response.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The server answered with a status and a body that is not an
    /// envelope (a proxy error page, for instance).
    #[error("unexpected http status {status}: {body}")]
    Http {
        /// HTTP status code.
        status: u16,
        /// Raw response body.
        body: String,
    },

    /// The response body could not be interpreted.
    #[error("failed to decode response: {0}")]
    Decode(String),

    /// The server rejected the request with a code that has no dedicated
    /// variant.
    #[error("server error {code}: {message}")]
    Business {
        /// Error code from the envelope.
        code: i64,
        /// Error message from the envelope.
        message: String,
    },

    /// The cursor is malformed or belongs to another resource type.
    #[error("invalid cursor: {0}")]
    InvalidCursor(String),

    /// The cursor points past the retention window. Events were lost.
    #[error("cursor expired: {0}")]
    CursorExpired(String),

    /// The resource type is not served.
    #[error("unknown resource type: {0}")]
    UnknownResourceType(String),
}

impl ClientError {
    /// Whether retrying the same request can never succeed.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Http { .. } => false,
            Self::Business { code, .. } => *code == ErrorCode::InvalidParams.as_i64(),
            Self::Decode(_)
            | Self::InvalidCursor(_)
            | Self::CursorExpired(_)
            | Self::UnknownResourceType(_) => true,
        }
    }
}

impl From<WatchError> for ClientError {
    fn from(err: WatchError) -> Self {
        match err {
            WatchError::UnknownResourceType(msg) => Self::UnknownResourceType(msg),
            WatchError::InvalidCursor(msg) => Self::InvalidCursor(msg),
            WatchError::CursorExpired(msg) => Self::CursorExpired(msg),
            e @ WatchError::InvalidParams(_) => Self::Business {
                code: e.code().as_i64(),
                message: e.to_string(),
            },
        }
    }
}
