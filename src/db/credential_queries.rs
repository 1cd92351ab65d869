use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::credential::Credential;

const CREDENTIAL_COLUMNS: &str = "id, key_hash, label, is_active, rate_limit_per_minute, \
     total_requests, last_used_at, created_at";

/// Look up a credential by the SHA-256 digest of its key.
pub async fn find_by_hash(pool: &PgPool, key_hash: &str) -> Result<Option<Credential>, sqlx::Error> {
    sqlx::query_as::<_, Credential>(&format!(
        "SELECT {CREDENTIAL_COLUMNS} FROM api_credentials WHERE key_hash = $1"
    ))
    .bind(key_hash)
    .fetch_optional(pool)
    .await
}

/// Insert a new credential record.
pub async fn insert(pool: &PgPool, credential: &Credential) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO api_credentials (id, key_hash, label, is_active, rate_limit_per_minute, created_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(credential.id)
    .bind(&credential.key_hash)
    .bind(&credential.label)
    .bind(credential.is_active)
    .bind(credential.rate_limit_per_minute)
    .bind(credential.created_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Deactivate a credential. Returns false if no such credential exists.
pub async fn deactivate(pool: &PgPool, id: Uuid) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("UPDATE api_credentials SET is_active = FALSE WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;

    Ok(result.rows_affected() > 0)
}

/// Bump the usage counter and last-used timestamp.
pub async fn record_usage(pool: &PgPool, id: Uuid, at: DateTime<Utc>) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE api_credentials
        SET total_requests = total_requests + 1,
            last_used_at = $2
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(at)
    .execute(pool)
    .await?;

    Ok(())
}

/// All credentials, newest first.
pub async fn list(pool: &PgPool) -> Result<Vec<Credential>, sqlx::Error> {
    sqlx::query_as::<_, Credential>(&format!(
        "SELECT {CREDENTIAL_COLUMNS} FROM api_credentials ORDER BY created_at DESC"
    ))
    .fetch_all(pool)
    .await
}
