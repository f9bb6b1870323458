//! Request-level error taxonomy for the watch protocol.

use serde::{Deserialize, Serialize};

/// Stable numeric codes carried in the response envelope.
///
/// Clients map these back to [`WatchError`] variants, so the values must
/// never be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    /// The request succeeded.
    Success,
    /// A request parameter is missing or out of range.
    InvalidParams,
    /// The requested resource type is not registered.
    UnknownResourceType,
    /// The resume cursor is malformed or was produced by another encoding.
    InvalidCursor,
    /// The chain node behind the cursor has been evicted by retention.
    CursorExpired,
    /// The server failed while reading the chain.
    Internal,
}

impl ErrorCode {
    /// Returns the wire value for this code.
    pub fn as_i64(self) -> i64 {
        match self {
            Self::Success => 0,
            Self::InvalidParams => 1_199_006,
            Self::UnknownResourceType => 1_199_040,
            Self::InvalidCursor => 1_199_041,
            Self::CursorExpired => 1_199_042,
            Self::Internal => 1_199_999,
        }
    }

    /// Converts a wire value back into a code.
    ///
    /// Returns `None` for values this version does not know about.
    pub fn from_i64(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Success),
            1_199_006 => Some(Self::InvalidParams),
            1_199_040 => Some(Self::UnknownResourceType),
            1_199_041 => Some(Self::InvalidCursor),
            1_199_042 => Some(Self::CursorExpired),
            1_199_999 => Some(Self::Internal),
            _ => None,
        }
    }
}

/// Errors raised while interpreting a watch request.
///
/// Each variant is fatal for the request that produced it but never for
/// the process.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WatchError {
    /// The resource or cursor type is not registered.
    #[error("unknown resource type: {0}")]
    UnknownResourceType(String),

    /// The cursor string is malformed or version-incompatible.
    #[error("invalid cursor: {0}")]
    InvalidCursor(String),

    /// The chain node referenced by the cursor is past the retention window.
    #[error("cursor expired: {0}")]
    CursorExpired(String),

    /// A request parameter is invalid.
    #[error("invalid parameter: {0}")]
    InvalidParams(String),
}

impl WatchError {
    /// Returns the envelope code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::UnknownResourceType(_) => ErrorCode::UnknownResourceType,
            Self::InvalidCursor(_) => ErrorCode::InvalidCursor,
            Self::CursorExpired(_) => ErrorCode::CursorExpired,
            Self::InvalidParams(_) => ErrorCode::InvalidParams,
        }
    }

    /// Rebuilds an error from an envelope code and message.
    ///
    /// Returns `None` when the code does not correspond to a request-level
    /// error (success, internal, or unknown codes).
    pub fn from_code(code: i64, message: impl Into<String>) -> Option<Self> {
        let message = message.into();
        match ErrorCode::from_i64(code)? {
            ErrorCode::UnknownResourceType => Some(Self::UnknownResourceType(message)),
            ErrorCode::InvalidCursor => Some(Self::InvalidCursor(message)),
            ErrorCode::CursorExpired => Some(Self::CursorExpired(message)),
            ErrorCode::InvalidParams => Some(Self::InvalidParams(message)),
            ErrorCode::Success | ErrorCode::Internal => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_survive_the_wire() {
        for code in [
            ErrorCode::Success,
            ErrorCode::InvalidParams,
            ErrorCode::UnknownResourceType,
            ErrorCode::InvalidCursor,
            ErrorCode::CursorExpired,
            ErrorCode::Internal,
        ] {
            assert_eq!(ErrorCode::from_i64(code.as_i64()), Some(code));
        }
        assert_eq!(ErrorCode::from_i64(42), None);
    }

    #[test]
    fn watch_error_rebuilds_from_code() {
        let err = WatchError::CursorExpired("node gone".to_string());
        let rebuilt = WatchError::from_code(err.code().as_i64(), "node gone");
        assert_eq!(rebuilt, Some(err));

        assert_eq!(WatchError::from_code(ErrorCode::Internal.as_i64(), "boom"), None);
    }
}
