use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::db::credential_queries;
use crate::models::credential::Credential;

/// Keys shorter than this are rejected before any lookup.
pub const MIN_KEY_LENGTH: usize = 16;

/// Hash an API key for storage and lookup.
pub fn hash_api_key(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

/// Compare two key digests in constant time.
pub fn digests_match(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

fn well_formed(key: &str) -> bool {
    key.len() >= MIN_KEY_LENGTH
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Generate a URL-safe API key from 32 random bytes.
pub fn generate_api_key() -> String {
    use base64::Engine;
    use rand::RngCore;

    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

/// Persistence for hashed credentials.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn find_by_hash(&self, key_hash: &str) -> Result<Option<Credential>, AuthError>;

    async fn record_usage(&self, credential_id: Uuid, at: DateTime<Utc>) -> Result<(), AuthError>;
}

pub struct PgCredentialStore {
    pool: PgPool,
}

impl PgCredentialStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CredentialStore for PgCredentialStore {
    async fn find_by_hash(&self, key_hash: &str) -> Result<Option<Credential>, AuthError> {
        let found = credential_queries::find_by_hash(&self.pool, key_hash)
            .await
            .map_err(|e| AuthError::Unavailable(e.to_string()))?;
        Ok(found.filter(|c| digests_match(&c.key_hash, key_hash)))
    }

    async fn record_usage(&self, credential_id: Uuid, at: DateTime<Utc>) -> Result<(), AuthError> {
        credential_queries::record_usage(&self.pool, credential_id, at)
            .await
            .map_err(|e| AuthError::Unavailable(e.to_string()))
    }
}

/// Process-local credential store. Lookup scans every entry so the time taken
/// does not depend on which credential matched.
#[derive(Default)]
pub struct InMemoryCredentialStore {
    credentials: RwLock<HashMap<Uuid, Credential>>,
}

impl InMemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, credential: Credential) {
        self.credentials
            .write()
            .await
            .insert(credential.id, credential);
    }

    pub async fn deactivate(&self, credential_id: Uuid) -> bool {
        match self.credentials.write().await.get_mut(&credential_id) {
            Some(c) => {
                c.is_active = false;
                true
            }
            None => false,
        }
    }

    pub async fn get(&self, credential_id: Uuid) -> Option<Credential> {
        self.credentials.read().await.get(&credential_id).cloned()
    }
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn find_by_hash(&self, key_hash: &str) -> Result<Option<Credential>, AuthError> {
        let credentials = self.credentials.read().await;
        let mut found = None;
        for credential in credentials.values() {
            if digests_match(&credential.key_hash, key_hash) {
                found = Some(credential.clone());
            }
        }
        Ok(found)
    }

    async fn record_usage(&self, credential_id: Uuid, at: DateTime<Utc>) -> Result<(), AuthError> {
        if let Some(c) = self.credentials.write().await.get_mut(&credential_id) {
            c.total_requests += 1;
            c.last_used_at = Some(at);
        }
        Ok(())
    }
}

/// Authenticates presented API keys against a credential store.
#[derive(Clone)]
pub struct Authenticator {
    store: Arc<dyn CredentialStore>,
}

impl Authenticator {
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self { store }
    }

    /// Resolve a presented key to an active credential.
    pub async fn authenticate(&self, presented: Option<&str>) -> Result<Credential, AuthError> {
        let key = presented.ok_or(AuthError::MissingKey)?;
        if !well_formed(key) {
            return Err(AuthError::MalformedKey);
        }

        let key_hash = hash_api_key(key);
        match self.store.find_by_hash(&key_hash).await? {
            Some(credential) if credential.is_active => Ok(credential),
            _ => {
                tracing::warn!(key_prefix = %&key[..4], "Authentication failed");
                Err(AuthError::Unauthorized)
            }
        }
    }

    /// Bump usage counters in the background. Failures are logged only.
    pub fn record_usage(&self, credential: &Credential) {
        let store = self.store.clone();
        let credential_id = credential.id;
        tokio::spawn(async move {
            if let Err(e) = store.record_usage(credential_id, Utc::now()).await {
                tracing::warn!(%credential_id, error = %e, "Failed to record credential usage");
            }
        });
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Missing API key. Include the 'X-API-Key' header.")]
    MissingKey,

    #[error("Invalid API key format")]
    MalformedKey,

    #[error("Invalid API key")]
    Unauthorized,

    #[error("Credential store unavailable: {0}")]
    Unavailable(String),
}
