use sqlx::PgPool;
use tokio::sync::mpsc;

use crate::db::execution_repo;
use crate::models::ExecutionRecord;

/// Persist execution records as relays produce them. Exits when every
/// sender has been dropped.
pub async fn run_record_writer(pool: PgPool, mut records: mpsc::Receiver<ExecutionRecord>) {
    let mut written: u64 = 0;

    while let Some(record) = records.recv().await {
        match execution_repo::insert_record(&pool, &record).await {
            Ok(()) => {
                written += 1;
                tracing::debug!(
                    signal_id = %record.signal_id,
                    follower = %record.follower_id,
                    status = %record.status,
                    "Execution record persisted"
                );
            }
            Err(e) => {
                tracing::error!(
                    error = %e,
                    signal_id = %record.signal_id,
                    follower = %record.follower_id,
                    "Failed to persist execution record"
                );
            }
        }
    }

    tracing::info!(written, "Record writer stopped");
}
