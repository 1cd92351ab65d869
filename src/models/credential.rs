use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An API credential. Only the SHA-256 digest of the key is ever stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Credential {
    pub id: Uuid,
    pub key_hash: String,
    pub label: String,
    pub is_active: bool,
    pub rate_limit_per_minute: i32,
    pub total_requests: i64,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Credential {
    pub fn new(key_hash: String, label: &str, rate_limit_per_minute: i32) -> Self {
        Self {
            id: Uuid::new_v4(),
            key_hash,
            label: label.to_string(),
            is_active: true,
            rate_limit_per_minute,
            total_requests: 0,
            last_used_at: None,
            created_at: Utc::now(),
        }
    }
}
