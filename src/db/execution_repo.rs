use sqlx::PgPool;

use crate::models::ExecutionRecord;

/// Persist a terminal execution record. Re-inserting the same record is a
/// no-op.
pub async fn insert_record(pool: &PgPool, record: &ExecutionRecord) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO execution_records
            (id, signal_id, leader_id, follower_id, kind, symbol, side, size, order_type,
             reduce_only, status, reason, attempts, exchange_order_id, executed_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
        ON CONFLICT (id) DO NOTHING
        "#,
    )
    .bind(record.id)
    .bind(&record.signal_id)
    .bind(&record.leader_id)
    .bind(&record.follower_id)
    .bind(record.kind.to_string())
    .bind(&record.symbol)
    .bind(record.side.map(|s| s.as_str()))
    .bind(record.size)
    .bind(record.order_type.map(|t| t.to_string()))
    .bind(record.reduce_only)
    .bind(record.status.to_string())
    .bind(&record.reason)
    .bind(record.attempts as i32)
    .bind(&record.exchange_order_id)
    .bind(record.executed_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Number of records per status for one leader.
pub async fn count_by_status(pool: &PgPool, leader_id: &str) -> anyhow::Result<Vec<(String, i64)>> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        r#"
        SELECT status, COUNT(*)
        FROM execution_records
        WHERE leader_id = $1
        GROUP BY status
        ORDER BY status
        "#,
    )
    .bind(leader_id)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}
