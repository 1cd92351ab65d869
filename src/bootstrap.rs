//! Assembly of storage backends from configuration, shared by the API server
//! and the worker.

use sqlx::PgPool;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::config::AppConfig;
use crate::db;
use crate::models::credential::Credential;
use crate::services::auth::{
    hash_api_key, CredentialStore, InMemoryCredentialStore, PgCredentialStore,
};
use crate::services::inference::{ImageFetcher, InferenceClient, InferenceError};
use crate::services::job_store::{InMemoryJobStore, JobStore, PgJobStore};
use crate::services::rate_limit::{InMemoryRateLimitStore, PgRateLimitStore, RateLimitStore};
use crate::services::retry::RetryPolicy;
use crate::services::storage::{ArtifactStore, InMemoryArtifactStore, S3ArtifactStore, StorageError};
use crate::services::webhook::{NoopNotifier, Notifier, WebhookDispatcher};

/// Persistence backends: PostgreSQL when configured, process memory otherwise.
pub struct Backends {
    pub pool: Option<PgPool>,
    pub jobs: Arc<dyn JobStore>,
    pub credentials: Arc<dyn CredentialStore>,
    pub rate_limits: Arc<dyn RateLimitStore>,
}

impl Backends {
    pub async fn connect(config: &AppConfig) -> Result<Self, BootstrapError> {
        match &config.database_url {
            Some(url) => {
                tracing::info!("Connecting to PostgreSQL");
                let pool = db::init_pool(url, config.db_max_connections).await?;
                tracing::info!("Running database migrations");
                db::run_migrations(&pool).await?;

                Ok(Self {
                    jobs: Arc::new(PgJobStore::new(pool.clone())),
                    credentials: Arc::new(PgCredentialStore::new(pool.clone())),
                    rate_limits: Arc::new(PgRateLimitStore::new(pool.clone())),
                    pool: Some(pool),
                })
            }
            None => {
                tracing::warn!("DATABASE_URL not set, jobs and credentials are kept in memory");
                let credentials = Arc::new(InMemoryCredentialStore::new());
                match &config.bootstrap_api_key {
                    Some(key) => {
                        let credential = Credential::new(
                            hash_api_key(key),
                            "bootstrap",
                            config.bootstrap_rate_limit_per_minute,
                        );
                        tracing::info!(credential_id = %credential.id, "Registered bootstrap credential");
                        credentials.insert(credential).await;
                    }
                    None => tracing::warn!("BOOTSTRAP_API_KEY not set, no caller can authenticate"),
                }

                Ok(Self {
                    pool: None,
                    jobs: Arc::new(InMemoryJobStore::new()),
                    credentials,
                    rate_limits: Arc::new(InMemoryRateLimitStore::new()),
                })
            }
        }
    }
}

pub fn artifact_store(config: &AppConfig) -> Result<Arc<dyn ArtifactStore>, BootstrapError> {
    match &config.s3_bucket {
        Some(bucket) => {
            tracing::info!(bucket = %bucket, "Initializing S3 artifact store");
            let store = S3ArtifactStore::new(
                bucket,
                &config.s3_endpoint,
                &config.s3_region,
                &config.s3_access_key,
                &config.s3_secret_key,
            )?
            .with_public_base_url(config.artifact_public_base_url.clone())
            .with_url_ttl(Duration::from_secs(u64::from(config.artifact_url_ttl_secs)));
            Ok(Arc::new(store))
        }
        None => {
            tracing::warn!("S3_BUCKET not set, artifacts are kept in memory");
            Ok(Arc::new(InMemoryArtifactStore::new()))
        }
    }
}

pub fn upload_policy(config: &AppConfig) -> RetryPolicy {
    RetryPolicy::new(
        config.upload_max_attempts,
        Duration::from_millis(config.upload_backoff_base_ms),
    )
}

/// Webhook dispatcher when a signing secret is configured, otherwise a no-op.
pub fn notifier(config: &AppConfig, jobs: Arc<dyn JobStore>) -> Arc<dyn Notifier> {
    match &config.webhook_secret {
        Some(secret) => Arc::new(WebhookDispatcher::new(
            secret.clone(),
            jobs,
            RetryPolicy::new(
                config.webhook_max_attempts,
                Duration::from_millis(config.webhook_backoff_base_ms),
            ),
            Duration::from_secs(config.webhook_timeout_secs),
        )),
        None => {
            tracing::warn!("WEBHOOK_SECRET not set, webhook notifications are disabled");
            Arc::new(NoopNotifier)
        }
    }
}

pub fn image_root(config: &AppConfig) -> Option<PathBuf> {
    config.image_root.as_ref().map(PathBuf::from)
}

pub fn inference_client(config: &AppConfig) -> Result<InferenceClient, BootstrapError> {
    Ok(InferenceClient::new(
        config.inference_url.clone(),
        config.inference_token.clone(),
    )?)
}

pub fn image_fetcher(config: &AppConfig) -> ImageFetcher {
    ImageFetcher::new(
        image_root(config),
        Duration::from_secs(config.image_fetch_timeout_secs),
    )
}

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Artifact storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Inference client error: {0}")]
    Inference(#[from] InferenceError),
}
