//! Connection pools over the chain database.
//!
//! The server keeps two pools on the same file. The writer pool runs
//! migrations, bootstrap and the retention purge, and is the one that
//! switches the file into WAL mode. The reader pool serves watch requests;
//! its connections are opened read-only with `query_only` set, so a held
//! watch can never take the write lock that an external chain writer needs.

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OpenFlags};
use thiserror::Error;

/// Connection tunables for the chain database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    /// How long a connection waits on a locked database, in milliseconds.
    pub busy_timeout_ms: u64,

    /// Upper bound on pooled connections.
    pub pool_max_size: u32,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5_000,
            pool_max_size: 8,
        }
    }
}

/// Shared SQLite connection pool.
pub type DbPool = Pool<SqliteConnectionManager>;

/// Errors raised while opening a pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The pool could not be built or its first connection failed to open.
    #[error("failed to open chain database pool: {0}")]
    PoolInit(#[from] r2d2::Error),
}

/// Opens the writer pool over the database at `db_path`.
///
/// Pass `:memory:` for a throwaway database; each in-memory connection is
/// a separate database, so tests use `pool_max_size: 1` and serve watches
/// from this pool directly.
///
/// # Errors
///
/// Returns `PoolError::PoolInit` if the pool cannot be created.
pub fn create_pool(db_path: &str, settings: PoolSettings) -> Result<DbPool, PoolError> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_FULL_MUTEX;

    let manager = SqliteConnectionManager::file(db_path)
        .with_flags(flags)
        .with_init(move |conn| {
            let journal_mode: String =
                conn.query_row("PRAGMA journal_mode = WAL;", [], |row| row.get(0))?;
            require_wal(&journal_mode)?;
            conn.execute_batch("PRAGMA synchronous = NORMAL;")?;
            set_busy_timeout(conn, settings)
        });

    build(db_path, manager, settings, "writer")
}

/// Opens the read-only pool the watch endpoint reads chains through.
///
/// The file must already exist and be in WAL mode, which the writer pool
/// guarantees once it has opened the same path.
///
/// # Errors
///
/// Returns `PoolError::PoolInit` if the pool cannot be created, the file is
/// missing, or it is not in WAL mode.
pub fn create_read_pool(db_path: &str, settings: PoolSettings) -> Result<DbPool, PoolError> {
    let flags = OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_FULL_MUTEX;

    let manager = SqliteConnectionManager::file(db_path)
        .with_flags(flags)
        .with_init(move |conn| {
            let journal_mode: String =
                conn.query_row("PRAGMA journal_mode;", [], |row| row.get(0))?;
            require_wal(&journal_mode)?;
            conn.execute_batch("PRAGMA query_only = ON;")?;
            set_busy_timeout(conn, settings)
        });

    build(db_path, manager, settings, "reader")
}

// In-memory databases report "memory".
fn require_wal(journal_mode: &str) -> rusqlite::Result<()> {
    if journal_mode == "wal" || journal_mode == "memory" {
        return Ok(());
    }
    Err(rusqlite::Error::SqliteFailure(
        rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_ERROR),
        Some(format!("chain database is in {journal_mode} mode, not wal")),
    ))
}

fn set_busy_timeout(conn: &Connection, settings: PoolSettings) -> rusqlite::Result<()> {
    conn.execute_batch(&format!(
        "PRAGMA busy_timeout = {};",
        settings.busy_timeout_ms
    ))
}

fn build(
    db_path: &str,
    manager: SqliteConnectionManager,
    settings: PoolSettings,
    role: &'static str,
) -> Result<DbPool, PoolError> {
    let pool = Pool::builder()
        .max_size(settings.pool_max_size)
        .build(manager)?;

    tracing::debug!(
        db_path,
        role,
        pool_max_size = settings.pool_max_size,
        "opened chain database pool"
    );

    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{append_node, latest_node, NewChainNode};
    use crate::{bootstrap_resources, run_migrations};
    use chainwatch_types::{ClusterTime, CursorType, EventType, ResourceRegistry};

    const NOW: i64 = 1_700_000_000;

    #[test]
    fn pool_applies_settings() {
        let settings = PoolSettings {
            busy_timeout_ms: 1_500,
            pool_max_size: 2,
        };

        let pool = create_pool(":memory:", settings).expect("pool creation should succeed");
        let conn = pool.get().expect("should get a connection");

        let busy_timeout: i64 = conn
            .query_row("PRAGMA busy_timeout;", [], |row| row.get(0))
            .expect("should query busy_timeout");
        assert_eq!(busy_timeout, 1_500);
        assert_eq!(pool.max_size(), 2);
    }

    #[test]
    fn file_pool_uses_wal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("chain.db");
        let pool = create_pool(
            path.to_str().expect("utf-8 path"),
            PoolSettings::default(),
        )
        .expect("pool creation should succeed");

        let conn = pool.get().expect("should get a connection");
        let mode: String = conn
            .query_row("PRAGMA journal_mode;", [], |row| row.get(0))
            .expect("should query journal_mode");
        assert_eq!(mode, "wal");
    }

    #[test]
    fn reader_sees_appends_but_cannot_write() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("chain.db");
        let path = path.to_str().expect("utf-8 path");
        let registry = ResourceRegistry::with_types(&[CursorType::Host]);
        let host = registry.key_for(CursorType::Host).unwrap();

        let writer = create_pool(path, PoolSettings::default()).unwrap();
        {
            let conn = writer.get().unwrap();
            run_migrations(&conn).unwrap();
            bootstrap_resources(&conn, &registry, NOW).unwrap();
        }
        let reader = create_read_pool(path, PoolSettings::default()).unwrap();

        let appended = append_node(
            &writer.get().unwrap(),
            host,
            &NewChainNode::new("h1", EventType::Create, ClusterTime::new(NOW as u32, 0)),
        )
        .unwrap();

        let conn = reader.get().unwrap();
        assert_eq!(latest_node(&conn, host, 0).unwrap(), Some(appended));
        assert!(append_node(
            &conn,
            host,
            &NewChainNode::new("h2", EventType::Create, ClusterTime::new(NOW as u32, 1)),
        )
        .is_err());
    }

    #[test]
    fn only_wal_and_memory_journals_are_accepted() {
        assert!(require_wal("wal").is_ok());
        assert!(require_wal("memory").is_ok());
        assert!(require_wal("delete").is_err());
    }
}
