//! Idempotent bootstrap of chain collections, their indexes, and the
//! token store.
//!
//! Every step checks before it creates, and a creation that loses a race
//! with another process ("already exists", duplicate key) counts as done.
//! Any other failure is returned as a [`BootstrapError`] and is meant to
//! abort startup.

use chainwatch_types::{CursorType, KeyKind, ResourceKey, ResourceRegistry};
use rusqlite::Connection;
use serde_json::{json, Map, Value};

use crate::chain::create_chain_table;
use crate::store::{
    count_tokens, create_index, has_table, index_names, insert_token, is_duplicate_error,
    IndexSpec, SortOrder, StoreError,
};

/// Unique index on the node id.
pub const INDEX_ID: &str = "index_id";
/// Unique index on the node cursor.
pub const INDEX_CURSOR: &str = "index_cursor";
/// Expiring index on the node cluster time.
pub const INDEX_CLUSTER_TIME: &str = "index_cluster_time";
/// Partition index for partitioned resource types.
pub const INDEX_SUB_RESOURCE: &str = "index_sub_resource";

/// Bootstrap phase that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapStep {
    /// Creating the chain table.
    ChainCollection,
    /// Creating chain indexes.
    Indexes,
    /// Inserting the token document.
    Token,
}

impl std::fmt::Display for BootstrapStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::ChainCollection => "chain collection",
            Self::Indexes => "indexes",
            Self::Token => "token",
        })
    }
}

/// A bootstrap step failed for a reason other than "already exists".
#[derive(Debug, thiserror::Error)]
#[error("bootstrap of {resource} failed at {step}: {source}")]
pub struct BootstrapError {
    /// Resource being bootstrapped.
    pub resource: CursorType,
    /// Step that failed.
    pub step: BootstrapStep,
    /// Underlying store error.
    pub source: StoreError,
}

impl BootstrapError {
    fn new(key: &ResourceKey, step: BootstrapStep, source: StoreError) -> Self {
        Self {
            resource: key.cursor_type(),
            step,
            source,
        }
    }
}

/// What a bootstrap run created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BootstrapReport {
    /// Resource keys processed.
    pub resources: usize,
    /// Chain tables created.
    pub collections_created: usize,
    /// Indexes created.
    pub indexes_created: usize,
    /// Token documents inserted.
    pub tokens_inserted: usize,
}

/// The index set every chain of `key` must carry.
pub fn chain_indexes(key: &ResourceKey) -> Vec<IndexSpec> {
    let mut indexes = vec![
        IndexSpec::single(INDEX_ID, "id", SortOrder::Desc).unique(),
        IndexSpec::single(INDEX_CURSOR, "cursor", SortOrder::Desc).unique(),
        IndexSpec::single(INDEX_CLUSTER_TIME, "cluster_time_sec", SortOrder::Desc)
            .expire_after(key.ttl_seconds()),
    ];
    if key.is_partitioned() {
        indexes.push(IndexSpec::single(
            INDEX_SUB_RESOURCE,
            "sub_resource",
            SortOrder::Asc,
        ));
    }
    indexes
}

/// Ensures the chain table of `key` exists. Returns whether it was created.
///
/// # Errors
///
/// Returns `BootstrapError` when the existence check or creation fails for
/// a reason other than the table already existing.
pub fn ensure_chain_collection(
    conn: &Connection,
    key: &ResourceKey,
) -> Result<bool, BootstrapError> {
    let fail = |e: StoreError| BootstrapError::new(key, BootstrapStep::ChainCollection, e);

    if has_table(conn, key.chain_collection()).map_err(fail)? {
        return Ok(false);
    }
    match create_chain_table(conn, key) {
        Ok(()) => {
            tracing::info!(
                resource = %key.cursor_type(),
                table = key.chain_collection(),
                "created chain collection"
            );
            Ok(true)
        }
        Err(e) if is_duplicate_error(&e) => Ok(false),
        Err(e) => Err(fail(e)),
    }
}

/// Ensures every index of [`chain_indexes`] exists on the chain of `key`.
/// Returns how many were created.
///
/// Existing index names are read first and skipped.
///
/// # Errors
///
/// Returns `BootstrapError` when listing or creating an index fails for a
/// reason other than the index already existing.
pub fn ensure_indexes(conn: &Connection, key: &ResourceKey) -> Result<usize, BootstrapError> {
    let fail = |e: StoreError| BootstrapError::new(key, BootstrapStep::Indexes, e);
    let table = key.chain_collection();

    let existing = index_names(conn, table).map_err(fail)?;
    let mut created = 0;
    for spec in chain_indexes(key) {
        if existing.contains(&spec.name) {
            continue;
        }
        match create_index(conn, table, &spec) {
            Ok(()) => {
                tracing::debug!(table, index = %spec.name, "created chain index");
                created += 1;
            }
            Err(e) if is_duplicate_error(&e) => {}
            Err(e) => return Err(fail(e)),
        }
    }

    if created > 0 {
        tracing::info!(resource = %key.cursor_type(), created, "created chain indexes");
    }
    Ok(created)
}

/// Builds the initial token document for `key`.
///
/// Simple keys record their collection, an empty token, and `now` as the
/// start time. Composite keys get one `{coll, token}` sub-entry per backing
/// collection; keys that share a position across their collections also
/// carry `id: 0` and `token: ""`.
pub fn token_document(key: &ResourceKey, now: i64) -> Value {
    let mut doc = Map::new();
    doc.insert("_id".to_string(), json!(key.collection()));

    match key.kind() {
        KeyKind::Simple { collection } => {
            doc.insert("coll".to_string(), json!(collection));
            doc.insert("token".to_string(), json!(""));
            doc.insert("start_at_time".to_string(), json!({"sec": now, "nano": 0}));
        }
        KeyKind::Composite {
            collections,
            shared_position,
        } => {
            for collection in collections {
                doc.insert(
                    collection.clone(),
                    json!({"coll": collection, "token": ""}),
                );
            }
            if *shared_position {
                doc.insert("id".to_string(), json!(0));
                doc.insert("token".to_string(), json!(""));
            }
        }
    }

    Value::Object(doc)
}

/// Ensures the token document of `key` exists. Returns whether it was
/// inserted.
///
/// # Errors
///
/// Returns `BootstrapError` when counting or inserting fails for a reason
/// other than a concurrent insert of the same document.
pub fn ensure_token(conn: &Connection, key: &ResourceKey, now: i64) -> Result<bool, BootstrapError> {
    let fail = |e: StoreError| BootstrapError::new(key, BootstrapStep::Token, e);

    if count_tokens(conn, key.collection()).map_err(fail)? > 0 {
        return Ok(false);
    }
    match insert_token(conn, key.collection(), &token_document(key, now)) {
        Ok(()) => {
            tracing::info!(
                resource = %key.cursor_type(),
                key = key.collection(),
                "inserted watch token"
            );
            Ok(true)
        }
        Err(e) if is_duplicate_error(&e) => Ok(false),
        Err(e) => Err(fail(e)),
    }
}

/// Bootstraps every key of `registry` in registry order.
///
/// Stops at the first failure; nothing is rolled back, and a rerun picks up
/// where the failed run stopped.
///
/// # Errors
///
/// Returns the first `BootstrapError`.
pub fn bootstrap_resources(
    conn: &Connection,
    registry: &ResourceRegistry,
    now: i64,
) -> Result<BootstrapReport, BootstrapError> {
    let mut report = BootstrapReport::default();
    for key in registry.keys() {
        if ensure_chain_collection(conn, key)? {
            report.collections_created += 1;
        }
        report.indexes_created += ensure_indexes(conn, key)?;
        if ensure_token(conn, key, now)? {
            report.tokens_inserted += 1;
        }
        report.resources += 1;
    }

    tracing::info!(
        resources = report.resources,
        collections_created = report.collections_created,
        indexes_created = report.indexes_created,
        tokens_inserted = report.tokens_inserted,
        "watch bootstrap complete"
    );
    Ok(report)
}
