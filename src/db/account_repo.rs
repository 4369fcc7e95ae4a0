use sqlx::PgPool;

use crate::models::AccountCredential;

/// Look up one account's credentials.
pub async fn get_account(pool: &PgPool, id: &str) -> anyhow::Result<Option<AccountCredential>> {
    let account = sqlx::query_as::<_, AccountCredential>(
        "SELECT id, name, api_key, api_secret FROM accounts WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(account)
}

/// All accounts flagged as leaders, ordered by id.
pub async fn list_leaders(pool: &PgPool) -> anyhow::Result<Vec<AccountCredential>> {
    let leaders = sqlx::query_as::<_, AccountCredential>(
        r#"
        SELECT id, name, api_key, api_secret
        FROM accounts
        WHERE is_leader = TRUE
        ORDER BY id
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(leaders)
}
