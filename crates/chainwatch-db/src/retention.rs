//! Enforcement of expiring indexes.

use rusqlite::{params, Connection};

use crate::store::{check_identifier, has_table, StoreError};

/// Deletes every row that has outlived an expiring index, returning how
/// many rows were removed.
///
/// A row expires once its indexed field is older than
/// `now - expire_after_secs`. Catalog entries whose table no longer exists
/// are skipped.
///
/// # Errors
///
/// Returns `StoreError` on SQL failure or a catalog entry with an unsafe
/// name.
pub fn purge_expired(conn: &Connection, now: i64) -> Result<usize, StoreError> {
    let entries: Vec<(String, String, i64)> = {
        let mut stmt = conn.prepare(
            "SELECT table_name, field, expire_after_secs FROM _ttl_indexes
             ORDER BY table_name, index_name",
        )?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?;
        let entries = rows.collect::<Result<_, _>>()?;
        entries
    };

    let mut total = 0;
    for (table, field, expire_after_secs) in entries {
        if !has_table(conn, &table)? {
            continue;
        }
        let table = check_identifier(&table)?;
        let field = check_identifier(&field)?;
        let deleted = conn.execute(
            &format!("DELETE FROM \"{table}\" WHERE \"{field}\" < ?1"),
            params![now.saturating_sub(expire_after_secs)],
        )?;
        if deleted > 0 {
            tracing::debug!(table, deleted, "purged expired rows");
        }
        total += deleted;
    }
    Ok(total)
}
