use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

/// Window count for one credential, and the timestamp of its oldest entry.
#[derive(Debug, Clone, Copy)]
pub struct WindowSnapshot {
    pub count: i64,
    pub oldest: Option<DateTime<Utc>>,
}

/// Count the window and append a new entry if under `limit`, atomically for
/// the credential. The credential row lock serializes concurrent callers.
pub async fn check_and_record(
    pool: &PgPool,
    credential_id: Uuid,
    limit: i64,
    window_start: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<(WindowSnapshot, bool), sqlx::Error> {
    let mut tx = pool.begin().await?;

    sqlx::query("SELECT id FROM api_credentials WHERE id = $1 FOR UPDATE")
        .bind(credential_id)
        .fetch_optional(&mut *tx)
        .await?;

    let row = sqlx::query(
        r#"
        SELECT COUNT(*) AS count, MIN(requested_at) AS oldest
        FROM rate_limit_entries
        WHERE credential_id = $1 AND requested_at > $2
        "#,
    )
    .bind(credential_id)
    .bind(window_start)
    .fetch_one(&mut *tx)
    .await?;

    let snapshot = WindowSnapshot {
        count: row.try_get("count")?,
        oldest: row.try_get("oldest")?,
    };

    if snapshot.count >= limit {
        tx.rollback().await?;
        return Ok((snapshot, false));
    }

    sqlx::query("INSERT INTO rate_limit_entries (credential_id, requested_at) VALUES ($1, $2)")
        .bind(credential_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok((snapshot, true))
}

/// Delete window entries older than `cutoff`. Returns the number removed.
pub async fn prune(pool: &PgPool, cutoff: DateTime<Utc>) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM rate_limit_entries WHERE requested_at < $1")
        .bind(cutoff)
        .execute(pool)
        .await?;

    Ok(result.rows_affected())
}
