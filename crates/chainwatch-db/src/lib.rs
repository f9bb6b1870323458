//! Storage layer for chainwatch.
//!
//! Provides the SQLite connection pool, embedded migrations, the
//! document-store primitives (table and index inspection, token documents,
//! duplicate classification), the per-resource chain tables, their
//! idempotent bootstrap, and the retention purge.
//!
//! All functions take a borrowed [`rusqlite::Connection`] and are
//! synchronous; async callers run them on a blocking thread with a
//! connection from the pool. Functions that depend on the clock take `now`
//! (unix seconds) as a parameter.

pub mod bootstrap;
pub mod chain;
mod migrations;
mod pool;
pub mod retention;
pub mod store;

pub use bootstrap::{
    bootstrap_resources, ensure_chain_collection, ensure_indexes, ensure_token, BootstrapError,
    BootstrapReport, BootstrapStep,
};
pub use chain::NewChainNode;
pub use migrations::{run_migrations, MigrationError};
pub use pool::{create_pool, create_read_pool, DbPool, PoolError, PoolSettings};
pub use retention::purge_expired;
pub use store::StoreError;
