//! Opaque resume cursors.
//!
//! A cursor names a position in one resource's chain: the resource type,
//! the originating document id, and the cluster time of the change. The
//! encoded form is versioned so that a token minted by an incompatible
//! encoder is rejected instead of being misread.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::error::WatchError;
use crate::resource::CursorType;

/// Reserved cursor meaning "no event has been seen yet".
///
/// Its padding makes it unreachable from [`Cursor::encode`], which never
/// pads.
pub const NO_EVENT_CURSOR: &str = "MQ==";

const ENCODING_VERSION: &str = "1";
const FIELD_SEPARATOR: char = '\r';

/// Logical timestamp of a change: seconds plus an in-second sequence.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ClusterTime {
    /// Unix seconds.
    pub sec: u32,
    /// Ordinal within the second.
    pub nano: u32,
}

impl ClusterTime {
    /// Creates a cluster time.
    pub fn new(sec: u32, nano: u32) -> Self {
        Self { sec, nano }
    }
}

/// A decoded resume position.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Cursor {
    /// Resource type the cursor belongs to.
    pub cursor_type: CursorType,
    /// Identifier of the document whose change produced the event.
    pub oid: String,
    /// Cluster time of the change.
    pub cluster_time: ClusterTime,
}

impl Cursor {
    /// Creates a cursor.
    pub fn new(cursor_type: CursorType, oid: impl Into<String>, cluster_time: ClusterTime) -> Self {
        Self {
            cursor_type,
            oid: oid.into(),
            cluster_time,
        }
    }

    /// Encodes the cursor into its opaque string form.
    ///
    /// The oid is written last so it may contain the separator.
    pub fn encode(&self) -> String {
        let raw = format!(
            "{ENCODING_VERSION}{sep}{ty}{sep}{sec}{sep}{nano}{sep}{oid}",
            sep = FIELD_SEPARATOR,
            ty = self.cursor_type.as_str(),
            sec = self.cluster_time.sec,
            nano = self.cluster_time.nano,
            oid = self.oid,
        );
        URL_SAFE_NO_PAD.encode(raw.as_bytes())
    }

    /// Decodes an opaque cursor string.
    ///
    /// # Errors
    ///
    /// Returns `WatchError::InvalidCursor` when the input is empty, is not
    /// valid base64 or UTF-8, lacks a field, carries a non-numeric time,
    /// names an unknown resource type, or was written by another encoding
    /// version.
    pub fn decode(encoded: &str) -> Result<Self, WatchError> {
        if encoded.is_empty() {
            return Err(WatchError::InvalidCursor("cursor is empty".to_string()));
        }
        if encoded == NO_EVENT_CURSOR {
            return Err(WatchError::InvalidCursor(
                "the no-event marker does not name a position".to_string(),
            ));
        }

        let bytes = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|e| WatchError::InvalidCursor(format!("not base64: {e}")))?;
        let raw = String::from_utf8(bytes)
            .map_err(|_| WatchError::InvalidCursor("not utf-8".to_string()))?;

        let mut fields = raw.splitn(5, FIELD_SEPARATOR);
        let version = fields.next().unwrap_or_default();
        if version != ENCODING_VERSION {
            return Err(WatchError::InvalidCursor(format!(
                "unsupported encoding version {version:?}"
            )));
        }

        let (Some(ty), Some(sec), Some(nano), Some(oid)) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            return Err(WatchError::InvalidCursor("missing fields".to_string()));
        };

        let cursor_type: CursorType = ty
            .parse()
            .map_err(|_| WatchError::InvalidCursor(format!("unknown resource type {ty:?}")))?;
        let sec: u32 = sec
            .parse()
            .map_err(|_| WatchError::InvalidCursor(format!("bad seconds {sec:?}")))?;
        let nano: u32 = nano
            .parse()
            .map_err(|_| WatchError::InvalidCursor(format!("bad sequence {nano:?}")))?;

        Ok(Self {
            cursor_type,
            oid: oid.to_string(),
            cluster_time: ClusterTime { sec, nano },
        })
    }
}

impl std::fmt::Display for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.encode())
    }
}

impl std::str::FromStr for Cursor {
    type Err = WatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::decode(s)
    }
}
