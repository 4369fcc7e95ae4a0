use sqlx::PgPool;

use crate::models::link::FollowerLinkRow;
use crate::models::FollowerLink;

/// Links of one leader joined with their followers' credentials.
///
/// Rows that fail to convert (unknown copy mode) are logged and skipped so
/// one bad row does not take the whole relay down.
pub async fn links_for_leader(pool: &PgPool, leader_id: &str) -> anyhow::Result<Vec<FollowerLink>> {
    let rows = sqlx::query_as::<_, FollowerLinkRow>(
        r#"
        SELECT
            a.id            AS follower_id,
            a.name          AS follower_name,
            a.api_key,
            a.api_secret,
            l.leader_id,
            l.copy_mode,
            l.mode_value,
            l.min_lot,
            l.max_lot,
            l.max_daily_loss,
            l.max_open_positions,
            l.max_daily_trades,
            l.reverse_direction,
            l.copy_position_close,
            l.enabled
        FROM follower_links l
        JOIN accounts a ON a.id = l.follower_id
        WHERE l.leader_id = $1
        ORDER BY a.id
        "#,
    )
    .bind(leader_id)
    .fetch_all(pool)
    .await?;

    let mut links = Vec::with_capacity(rows.len());
    for row in rows {
        let follower_id = row.follower_id.clone();
        match FollowerLink::try_from(row) {
            Ok(link) => links.push(link),
            Err(e) => tracing::warn!(leader = %leader_id, follower = %follower_id, error = %e, "Skipping invalid follower link"),
        }
    }
    Ok(links)
}

/// Leader ids that have at least one link.
pub async fn linked_leader_ids(pool: &PgPool) -> anyhow::Result<Vec<String>> {
    let ids: Vec<(String,)> =
        sqlx::query_as("SELECT DISTINCT leader_id FROM follower_links ORDER BY leader_id")
            .fetch_all(pool)
            .await?;

    Ok(ids.into_iter().map(|(id,)| id).collect())
}
