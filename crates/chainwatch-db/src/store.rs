//! Document-store primitives the bootstrap and read paths are built on.
//!
//! Collections are SQLite tables. Index names are logical (`index_id`,
//! `index_cursor`, ...) and stored physically as `<table>_<logical>` because
//! SQLite index names share one namespace per database. Indexes created
//! with an expiry are recorded in the `_ttl_indexes` catalog.

use rusqlite::{params, Connection, OptionalExtension};

/// Table holding one token document per resource key.
pub const WATCH_TOKEN_TABLE: &str = "watch_token";

/// Errors raised by store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A database operation failed.
    #[error("store database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A document could not be serialized or parsed.
    #[error("store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A table, index or field name contains characters outside
    /// `[A-Za-z0-9_]`.
    #[error("invalid identifier: {0:?}")]
    InvalidIdentifier(String),
}

/// Direction of one index key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    /// Ascending.
    Asc,
    /// Descending.
    Desc,
}

impl SortOrder {
    fn as_sql(self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

/// Definition of one index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSpec {
    /// Logical index name, stable across releases.
    pub name: String,
    /// Indexed columns with their direction.
    pub keys: Vec<(String, SortOrder)>,
    /// Whether the index rejects duplicate keys.
    pub unique: bool,
    /// Seconds after which rows expire, measured on the first key.
    pub expire_after_secs: Option<i64>,
}

impl IndexSpec {
    /// A single-column index.
    pub fn single(name: &str, column: &str, order: SortOrder) -> Self {
        Self {
            name: name.to_string(),
            keys: vec![(column.to_string(), order)],
            unique: false,
            expire_after_secs: None,
        }
    }

    /// Marks the index unique.
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Gives the index a time-to-live.
    pub fn expire_after(mut self, secs: i64) -> Self {
        self.expire_after_secs = Some(secs);
        self
    }
}

pub(crate) fn check_identifier(name: &str) -> Result<&str, StoreError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(name)
    } else {
        Err(StoreError::InvalidIdentifier(name.to_string()))
    }
}

fn physical_index_name(table: &str, logical: &str) -> String {
    format!("{table}_{logical}")
}

/// Reports whether a table exists.
///
/// # Errors
///
/// Returns `StoreError::Database` on SQL failure.
pub fn has_table(conn: &Connection, table: &str) -> Result<bool, StoreError> {
    let exists = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
        [table],
        |row| row.get(0),
    )?;
    Ok(exists)
}

/// Lists the logical names of the indexes on a table.
///
/// SQLite's implicit indexes are not reported.
///
/// # Errors
///
/// Returns `StoreError::Database` on SQL failure.
pub fn index_names(conn: &Connection, table: &str) -> Result<Vec<String>, StoreError> {
    let prefix = format!("{table}_");
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master
         WHERE type = 'index' AND tbl_name = ?1 AND name NOT LIKE 'sqlite_autoindex%'
         ORDER BY name",
    )?;
    let rows = stmt.query_map([table], |row| row.get::<_, String>(0))?;

    let mut names = Vec::new();
    for row in rows {
        let name = row?;
        match name.strip_prefix(&prefix) {
            Some(logical) => names.push(logical.to_string()),
            None => names.push(name),
        }
    }
    Ok(names)
}

/// Creates an index on `table`.
///
/// Fails with an "already exists" error when the index is present; callers
/// that need idempotence check [`index_names`] first and classify races
/// with [`is_duplicate_error`].
///
/// # Errors
///
/// Returns `StoreError::InvalidIdentifier` for unsafe names and
/// `StoreError::Database` on SQL failure.
pub fn create_index(conn: &Connection, table: &str, spec: &IndexSpec) -> Result<(), StoreError> {
    let table = check_identifier(table)?;
    check_identifier(&spec.name)?;
    let mut columns = Vec::with_capacity(spec.keys.len());
    for (column, order) in &spec.keys {
        columns.push(format!("\"{}\" {}", check_identifier(column)?, order.as_sql()));
    }
    let first_column = spec
        .keys
        .first()
        .map(|(column, _)| column.as_str())
        .ok_or_else(|| StoreError::InvalidIdentifier(format!("{} has no keys", spec.name)))?;

    let sql = format!(
        "CREATE {unique}INDEX \"{index}\" ON \"{table}\" ({columns})",
        unique = if spec.unique { "UNIQUE " } else { "" },
        index = physical_index_name(table, &spec.name),
        columns = columns.join(", "),
    );

    let tx = conn.unchecked_transaction()?;
    tx.execute_batch(&sql)?;
    if let Some(expire_after_secs) = spec.expire_after_secs {
        tx.execute(
            "INSERT OR REPLACE INTO _ttl_indexes (table_name, index_name, field, expire_after_secs)
             VALUES (?1, ?2, ?3, ?4)",
            params![table, spec.name, first_column, expire_after_secs],
        )?;
    }
    tx.commit()?;
    Ok(())
}

/// Classifies an error as "the thing being created already exists".
///
/// Covers unique and primary key violations as well as schema objects
/// that are already present.
pub fn is_duplicate_error(err: &StoreError) -> bool {
    let StoreError::Database(rusqlite::Error::SqliteFailure(failure, message)) = err else {
        return false;
    };
    let key_violation = failure.code == rusqlite::ErrorCode::ConstraintViolation
        && matches!(
            failure.extended_code,
            rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE | rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
        );
    key_violation
        || message
            .as_deref()
            .is_some_and(|m| m.contains("already exists"))
}

/// Counts token documents with the given `_id`.
///
/// # Errors
///
/// Returns `StoreError::Database` on SQL failure.
pub fn count_tokens(conn: &Connection, id: &str) -> Result<i64, StoreError> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM watch_token WHERE id = ?1",
        [id],
        |row| row.get(0),
    )?;
    Ok(count)
}

/// Inserts a token document keyed by `id`.
///
/// # Errors
///
/// Returns `StoreError::Database` on SQL failure, including a primary key
/// violation when the document already exists.
pub fn insert_token(conn: &Connection, id: &str, doc: &serde_json::Value) -> Result<(), StoreError> {
    let doc_json = serde_json::to_string(doc)?;
    conn.execute(
        "INSERT INTO watch_token (id, doc_json) VALUES (?1, ?2)",
        params![id, doc_json],
    )?;
    Ok(())
}

/// Loads the token document keyed by `id`.
///
/// # Errors
///
/// Returns `StoreError::Database` on SQL failure or
/// `StoreError::Serialization` when the stored document is corrupt.
pub fn load_token(conn: &Connection, id: &str) -> Result<Option<serde_json::Value>, StoreError> {
    let doc_json: Option<String> = conn
        .query_row(
            "SELECT doc_json FROM watch_token WHERE id = ?1",
            [id],
            |row| row.get(0),
        )
        .optional()?;
    match doc_json {
        Some(json) => Ok(Some(serde_json::from_str(&json)?)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run_migrations;
    use serde_json::json;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().expect("should open in-memory db");
        run_migrations(&conn).expect("migrations should succeed");
        conn.execute_batch("CREATE TABLE things (id INTEGER, name TEXT, seen_at INTEGER)")
            .expect("should create table");
        conn
    }

    #[test]
    fn has_table_reports_existence() {
        let conn = setup();
        assert!(has_table(&conn, "things").unwrap());
        assert!(!has_table(&conn, "missing").unwrap());
    }

    #[test]
    fn index_names_are_logical() {
        let conn = setup();
        create_index(
            &conn,
            "things",
            &IndexSpec::single("index_id", "id", SortOrder::Desc).unique(),
        )
        .unwrap();
        create_index(
            &conn,
            "things",
            &IndexSpec::single("index_name", "name", SortOrder::Asc),
        )
        .unwrap();

        assert_eq!(index_names(&conn, "things").unwrap(), vec!["index_id", "index_name"]);
    }

    #[test]
    fn recreating_an_index_is_a_duplicate() {
        let conn = setup();
        let spec = IndexSpec::single("index_id", "id", SortOrder::Desc);
        create_index(&conn, "things", &spec).unwrap();

        let err = create_index(&conn, "things", &spec).expect_err("second create should fail");
        assert!(is_duplicate_error(&err), "unexpected error: {err:?}");
    }

    #[test]
    fn unique_violation_is_a_duplicate() {
        let conn = setup();
        create_index(
            &conn,
            "things",
            &IndexSpec::single("index_id", "id", SortOrder::Desc).unique(),
        )
        .unwrap();
        conn.execute("INSERT INTO things (id) VALUES (1)", []).unwrap();
        let err: StoreError = conn
            .execute("INSERT INTO things (id) VALUES (1)", [])
            .expect_err("duplicate id should fail")
            .into();
        assert!(is_duplicate_error(&err));
    }

    #[test]
    fn other_failures_are_not_duplicates() {
        let conn = setup();
        let err: StoreError = conn
            .execute("INSERT INTO missing (id) VALUES (1)", [])
            .expect_err("missing table should fail")
            .into();
        assert!(!is_duplicate_error(&err));
        assert!(!is_duplicate_error(&StoreError::InvalidIdentifier("x".into())));
    }

    #[test]
    fn expiring_index_is_cataloged() {
        let conn = setup();
        create_index(
            &conn,
            "things",
            &IndexSpec::single("index_seen_at", "seen_at", SortOrder::Desc).expire_after(60),
        )
        .unwrap();

        let (field, secs): (String, i64) = conn
            .query_row(
                "SELECT field, expire_after_secs FROM _ttl_indexes
                 WHERE table_name = 'things' AND index_name = 'index_seen_at'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(field, "seen_at");
        assert_eq!(secs, 60);
    }

    #[test]
    fn unsafe_identifiers_are_rejected() {
        let conn = setup();
        let err = create_index(
            &conn,
            "things; DROP TABLE things",
            &IndexSpec::single("index_id", "id", SortOrder::Asc),
        )
        .expect_err("should reject");
        assert!(matches!(err, StoreError::InvalidIdentifier(_)));
        assert!(has_table(&conn, "things").unwrap());
    }

    #[test]
    fn token_documents_round_trip() {
        let conn = setup();
        assert_eq!(count_tokens(&conn, "cc_HostBase").unwrap(), 0);
        assert!(load_token(&conn, "cc_HostBase").unwrap().is_none());

        let doc = json!({"_id": "cc_HostBase", "coll": "cc_HostBase", "token": ""});
        insert_token(&conn, "cc_HostBase", &doc).unwrap();

        assert_eq!(count_tokens(&conn, "cc_HostBase").unwrap(), 1);
        assert_eq!(load_token(&conn, "cc_HostBase").unwrap(), Some(doc.clone()));

        let err = insert_token(&conn, "cc_HostBase", &doc).expect_err("should conflict");
        assert!(is_duplicate_error(&err));
    }
}
