//! Background task that purges chain nodes past their retention window.

use chainwatch_db::DbPool;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::unix_now;

/// Runs [`chainwatch_db::purge_expired`] every `interval_seconds` until
/// `cancel` fires.
///
/// The first purge happens one interval after startup. Failures are logged
/// and the next round proceeds normally.
pub async fn start_retention_task(pool: DbPool, interval_seconds: u64, cancel: CancellationToken) {
    let interval = Duration::from_secs(interval_seconds.max(1));
    tracing::info!(interval_seconds, "starting chain retention task");

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            () = sleep(interval) => {}
        }

        let pool = pool.clone();
        let result = tokio::task::spawn_blocking(move || {
            let conn = pool.get().map_err(|e| e.to_string())?;
            chainwatch_db::purge_expired(&conn, unix_now()).map_err(|e| e.to_string())
        })
        .await;

        match result {
            Ok(Ok(count)) if count > 0 => {
                tracing::info!(count, "purged expired chain nodes");
            }
            Ok(Ok(_)) => {
                tracing::debug!("no expired chain nodes");
            }
            Ok(Err(e)) => {
                tracing::error!(error = %e, "failed to purge expired chain nodes");
            }
            Err(e) => {
                tracing::error!(error = %e, "retention task panicked or was cancelled");
            }
        }
    }

    tracing::info!("chain retention task stopped");
}
