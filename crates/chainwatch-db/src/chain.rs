//! Chain tables: the append-only, per-resource ledger of change events.
//!
//! Node IDs come from an `AUTOINCREMENT` rowid. SQLite keeps the largest ID
//! ever handed out in `sqlite_sequence`, so IDs keep increasing even after
//! the purge empties a chain. Every read takes a
//! `retained_since` bound (unix seconds) and ignores nodes whose cluster
//! time is older, so a node past its retention window is never served even
//! before the purge removes it.

use chainwatch_types::{ChainNode, ClusterTime, Cursor, EventType, ResourceKey};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::store::{check_identifier, StoreError};

const NODE_COLUMNS: &str = "id, cursor, oid, inst_id, event_type, cluster_time_sec, \
                            cluster_time_nano, sub_resource, detail_json";

const INSERT_COLUMNS: &str = "cursor, oid, inst_id, event_type, cluster_time_sec, \
                              cluster_time_nano, sub_resource, detail_json";

/// A change to append to a chain.
#[derive(Debug, Clone, PartialEq)]
pub struct NewChainNode {
    /// Identifier of the changed document.
    pub oid: String,
    /// Numeric instance id, `0` when the document has none.
    pub inst_id: i64,
    /// Kind of change.
    pub event_type: EventType,
    /// Cluster time of the change.
    pub cluster_time: ClusterTime,
    /// Partition key for partitioned resources.
    pub sub_resource: Option<String>,
    /// Document snapshot.
    pub detail: Option<serde_json::Value>,
}

impl NewChainNode {
    /// A change with no instance id, partition, or detail.
    pub fn new(oid: impl Into<String>, event_type: EventType, cluster_time: ClusterTime) -> Self {
        Self {
            oid: oid.into(),
            inst_id: 0,
            event_type,
            cluster_time,
            sub_resource: None,
            detail: None,
        }
    }

    /// Attaches a document snapshot.
    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = Some(detail);
        self
    }

    /// Attaches a partition key.
    pub fn with_sub_resource(mut self, sub_resource: impl Into<String>) -> Self {
        self.sub_resource = Some(sub_resource.into());
        self
    }
}

/// Creates the chain table for `key`.
///
/// `id` is the rowid and is never reused. Uniqueness of `cursor` comes from
/// the bootstrap indexes, so the index set alone describes the collection.
///
/// # Errors
///
/// Returns `StoreError::Database` when the table already exists or SQL
/// fails.
pub fn create_chain_table(conn: &Connection, key: &ResourceKey) -> Result<(), StoreError> {
    let table = check_identifier(key.chain_collection())?;
    conn.execute_batch(&format!(
        "CREATE TABLE \"{table}\" (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            cursor TEXT NOT NULL,
            oid TEXT NOT NULL,
            inst_id INTEGER NOT NULL DEFAULT 0,
            event_type TEXT NOT NULL,
            cluster_time_sec INTEGER NOT NULL,
            cluster_time_nano INTEGER NOT NULL,
            sub_resource TEXT,
            detail_json TEXT
        )"
    ))?;
    Ok(())
}

/// Appends a node to the chain of `key` and returns it.
///
/// The cursor is derived from the key's cursor type, the oid and the
/// cluster time.
///
/// # Errors
///
/// Returns `StoreError::Database` on SQL failure (including a unique index
/// violation for a repeated cursor) or `StoreError::Serialization` when the
/// detail cannot be encoded.
pub fn append_node(
    conn: &Connection,
    key: &ResourceKey,
    node: &NewChainNode,
) -> Result<ChainNode, StoreError> {
    let table = check_identifier(key.chain_collection())?;
    let cursor = Cursor::new(key.cursor_type(), node.oid.clone(), node.cluster_time).encode();
    let detail_json = node.detail.as_ref().map(serde_json::to_string).transpose()?;

    let id: i64 = conn.query_row(
        &format!(
            "INSERT INTO \"{table}\" ({INSERT_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             RETURNING id"
        ),
        params![
            cursor,
            node.oid,
            node.inst_id,
            node.event_type.as_str(),
            node.cluster_time.sec,
            node.cluster_time.nano,
            node.sub_resource,
            detail_json,
        ],
        |row| row.get(0),
    )?;

    tracing::trace!(
        resource = %key.cursor_type(),
        id,
        oid = %node.oid,
        "appended chain node"
    );

    Ok(ChainNode {
        id,
        cursor,
        oid: node.oid.clone(),
        inst_id: node.inst_id,
        event_type: node.event_type,
        cluster_time: node.cluster_time,
        sub_resource: node.sub_resource.clone(),
        detail: node.detail.clone(),
    })
}

/// Returns the newest retained node.
///
/// # Errors
///
/// Returns `StoreError` on SQL failure or a corrupt row.
pub fn latest_node(
    conn: &Connection,
    key: &ResourceKey,
    retained_since: i64,
) -> Result<Option<ChainNode>, StoreError> {
    select_one(
        conn,
        key,
        "cluster_time_sec >= ?1 ORDER BY id DESC LIMIT 1",
        params![retained_since],
    )
}

/// Returns the oldest retained node.
///
/// # Errors
///
/// Returns `StoreError` on SQL failure or a corrupt row.
pub fn earliest_node(
    conn: &Connection,
    key: &ResourceKey,
    retained_since: i64,
) -> Result<Option<ChainNode>, StoreError> {
    select_one(
        conn,
        key,
        "cluster_time_sec >= ?1 ORDER BY id ASC LIMIT 1",
        params![retained_since],
    )
}

/// Finds the retained node carrying `cursor`.
///
/// # Errors
///
/// Returns `StoreError` on SQL failure or a corrupt row.
pub fn find_node_by_cursor(
    conn: &Connection,
    key: &ResourceKey,
    cursor: &str,
    retained_since: i64,
) -> Result<Option<ChainNode>, StoreError> {
    select_one(
        conn,
        key,
        "cursor = ?1 AND cluster_time_sec >= ?2 LIMIT 1",
        params![cursor, retained_since],
    )
}

/// Returns the first retained node whose cluster time is strictly after
/// `start_from` seconds.
///
/// # Errors
///
/// Returns `StoreError` on SQL failure or a corrupt row.
pub fn first_node_after(
    conn: &Connection,
    key: &ResourceKey,
    start_from: i64,
    retained_since: i64,
) -> Result<Option<ChainNode>, StoreError> {
    select_one(
        conn,
        key,
        "cluster_time_sec > ?1 AND cluster_time_sec >= ?2 ORDER BY id ASC LIMIT 1",
        params![start_from, retained_since],
    )
}

/// Returns up to `limit` retained nodes with `id > after_id`, in ID order.
///
/// # Errors
///
/// Returns `StoreError` on SQL failure or a corrupt row.
pub fn nodes_after_id(
    conn: &Connection,
    key: &ResourceKey,
    after_id: i64,
    retained_since: i64,
    limit: usize,
) -> Result<Vec<ChainNode>, StoreError> {
    let table = check_identifier(key.chain_collection())?;
    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    let mut stmt = conn.prepare(&format!(
        "SELECT {NODE_COLUMNS} FROM \"{table}\"
         WHERE id > ?1 AND cluster_time_sec >= ?2
         ORDER BY id ASC
         LIMIT ?3"
    ))?;
    let rows = stmt.query_map(params![after_id, retained_since, limit], node_from_row)?;

    let mut nodes = Vec::new();
    for row in rows {
        nodes.push(row?);
    }
    Ok(nodes)
}

fn select_one(
    conn: &Connection,
    key: &ResourceKey,
    clause: &str,
    params: impl rusqlite::Params,
) -> Result<Option<ChainNode>, StoreError> {
    let table = check_identifier(key.chain_collection())?;
    let node = conn
        .query_row(
            &format!("SELECT {NODE_COLUMNS} FROM \"{table}\" WHERE {clause}"),
            params,
            node_from_row,
        )
        .optional()?;
    Ok(node)
}

fn node_from_row(row: &Row<'_>) -> rusqlite::Result<ChainNode> {
    let event_type: String = row.get(4)?;
    let event_type: EventType = event_type
        .parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, Type::Text, Box::new(e)))?;
    let detail_json: Option<String> = row.get(8)?;
    let detail = detail_json
        .map(|json| serde_json::from_str(&json))
        .transpose()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(8, Type::Text, Box::new(e)))?;

    Ok(ChainNode {
        id: row.get(0)?,
        cursor: row.get(1)?,
        oid: row.get(2)?,
        inst_id: row.get(3)?,
        event_type,
        cluster_time: ClusterTime::new(row.get(5)?, row.get(6)?),
        sub_resource: row.get(7)?,
        detail,
    })
}
