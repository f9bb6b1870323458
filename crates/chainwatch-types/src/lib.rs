//! Shared types, error definitions, and constants for chainwatch.
//!
//! This crate holds everything the server, the store, and the client must
//! agree on: the resume cursor codec, the closed set of watchable resource
//! types and their backing collections, the chain node model, and the
//! watch request/response wire types.
//!
//! It performs no I/O.

mod cursor;
mod error;
mod event;
mod resource;

pub use cursor::{ClusterTime, Cursor, NO_EVENT_CURSOR};
pub use error::{ErrorCode, WatchError};
pub use event::{
    ChainNode, Envelope, EventType, WatchEventDetail, WatchEventOptions, WatchFilter, WatchResp,
};
pub use resource::{
    CursorType, KeyKind, ResourceKey, ResourceRegistry, CHAIN_TTL_SECONDS, KEY_BIZ_SET_RELATION,
    KEY_HOST_IDENTITY, TABLE_BIZ_BASE, TABLE_BIZ_SET_BASE, TABLE_HOST_BASE, TABLE_INST_ASST,
    TABLE_MAINLINE_INSTANCE, TABLE_MODULE_BASE, TABLE_MODULE_HOST_CONFIG, TABLE_OBJECT_BASE,
    TABLE_PLAT_BASE, TABLE_PROCESS, TABLE_PROJECT_BASE, TABLE_SET_BASE,
};

/// Default port for the watch server.
pub const DEFAULT_PORT: u16 = 8731;

/// Path of the watch endpoint.
pub const WATCH_PATH: &str = "/api/v1/watch";
