//! Chain nodes and the watch request/response wire types.

use serde::{Deserialize, Serialize};

use crate::cursor::ClusterTime;
use crate::error::{ErrorCode, WatchError};
use crate::resource::CursorType;

/// Kind of change recorded by a chain node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    /// A document was inserted.
    Create,
    /// A document was updated or replaced.
    Update,
    /// A document was deleted.
    Delete,
}

impl EventType {
    /// Returns the wire tag for this event type.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventType {
    type Err = WatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            other => Err(WatchError::InvalidParams(format!(
                "unknown event type: {other}"
            ))),
        }
    }
}

/// One durable change event in a resource's chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainNode {
    /// Position in the chain; strictly increasing per resource type.
    pub id: i64,
    /// Encoded cursor naming this node; unique per chain.
    pub cursor: String,
    /// Identifier of the changed document.
    pub oid: String,
    /// Numeric instance id of the changed object, when it has one.
    #[serde(default)]
    pub inst_id: i64,
    /// Kind of change.
    pub event_type: EventType,
    /// Cluster time of the change.
    pub cluster_time: ClusterTime,
    /// Secondary partition key (object id) for partitioned resources.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_resource: Option<String>,
    /// Snapshot of the changed document served to watchers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

/// Server-side narrowing of a watch request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchFilter {
    /// Only return events of this sub resource (partitioned types only).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sub_resource: String,
}

/// Body of a watch request.
///
/// When `cursor` is non-empty it takes precedence over `start_from`; when
/// both are unset the request watches from the latest event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchEventOptions {
    /// Detail fields to return; empty means all.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<String>,
    /// Absolute unix seconds to start from.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub start_from: i64,
    /// Resume cursor.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cursor: String,
    /// Resource type to watch.
    pub resource: CursorType,
    /// Event types to return; empty means all.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub event_types: Vec<EventType>,
    /// Server-side filter.
    #[serde(default)]
    pub filter: WatchFilter,
}

fn is_zero(value: &i64) -> bool {
    *value == 0
}

impl WatchEventOptions {
    /// A request for `resource` with every optional field unset.
    pub fn new(resource: CursorType) -> Self {
        Self {
            fields: Vec::new(),
            start_from: 0,
            cursor: String::new(),
            resource,
            event_types: Vec::new(),
            filter: WatchFilter::default(),
        }
    }

    /// Checks the request for values the server never accepts.
    ///
    /// # Errors
    ///
    /// Returns `WatchError::InvalidParams` for a negative `start_from` or a
    /// sub resource filter on a type that is not partitioned.
    pub fn validate(&self) -> Result<(), WatchError> {
        if self.start_from < 0 {
            return Err(WatchError::InvalidParams(format!(
                "start_from must be absolute unix seconds, got {}",
                self.start_from
            )));
        }
        if !self.filter.sub_resource.is_empty() && !self.resource.is_partitioned() {
            return Err(WatchError::InvalidParams(format!(
                "resource {} has no sub resource",
                self.resource
            )));
        }
        Ok(())
    }
}

/// One event in a watch response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchEventDetail {
    /// Cursor to resume after this event.
    pub bk_cursor: String,
    /// Resource type of the event.
    pub bk_resource: CursorType,
    /// Kind of change; absent on cursor-only markers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bk_event_type: Option<EventType>,
    /// Event detail, projected to the requested fields.
    #[serde(default)]
    pub bk_detail: Option<serde_json::Value>,
}

impl WatchEventDetail {
    /// A marker carrying only a cursor, used when nothing was watched.
    pub fn cursor_only(cursor: impl Into<String>, resource: CursorType) -> Self {
        Self {
            bk_cursor: cursor.into(),
            bk_resource: resource,
            bk_event_type: None,
            bk_detail: None,
        }
    }
}

/// Payload of a watch response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchResp {
    /// Whether any event was watched. When `false`, `bk_events` holds at
    /// most one cursor-only marker to resume from.
    pub bk_watched: bool,
    /// Events in chain order.
    #[serde(default)]
    pub bk_events: Vec<WatchEventDetail>,
}

impl WatchResp {
    /// A response reporting nothing new, resuming from `cursor`.
    pub fn not_watched(cursor: impl Into<String>, resource: CursorType) -> Self {
        Self {
            bk_watched: false,
            bk_events: vec![WatchEventDetail::cursor_only(cursor, resource)],
        }
    }

    /// A response carrying watched events.
    pub fn watched(events: Vec<WatchEventDetail>) -> Self {
        Self {
            bk_watched: true,
            bk_events: events,
        }
    }
}

/// Generic response envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    /// `false` on business errors.
    pub result: bool,
    /// Error code, `0` on success.
    pub code: i64,
    /// Human readable error message, empty on success.
    #[serde(default)]
    pub message: String,
    /// Payload, present on success.
    #[serde(default = "Option::default")]
    pub data: Option<T>,
}

impl<T> Envelope<T> {
    /// A successful envelope.
    pub fn ok(data: T) -> Self {
        Self {
            result: true,
            code: ErrorCode::Success.as_i64(),
            message: String::new(),
            data: Some(data),
        }
    }

    /// A failed envelope.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            result: false,
            code: code.as_i64(),
            message: message.into(),
            data: None,
        }
    }
}
