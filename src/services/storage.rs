use async_trait::async_trait;
use chrono::{DateTime, Utc};
use s3::creds::Credentials;
use s3::{Bucket, Region};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::services::retry::RetryPolicy;

/// Reference to a stored artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactRef {
    pub object_key: String,
    pub url: String,
}

/// Deterministic object key for a job's video, so repeated uploads overwrite.
pub fn artifact_key(job_id: &str, created_at: DateTime<Utc>) -> String {
    format!("videos/{}/{}.mp4", created_at.format("%Y/%m/%d"), job_id)
}

/// Durable blob storage for generated videos.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn put(&self, key: &str, data: &[u8], content_type: &str) -> Result<(), StorageError>;

    /// A retrievable URL for a stored object.
    async fn url_for(&self, key: &str) -> Result<String, StorageError>;
}

/// Upload `data` under `key`, retrying with exponential backoff.
pub async fn upload_with_retry(
    store: &dyn ArtifactStore,
    policy: &RetryPolicy,
    key: &str,
    data: &[u8],
) -> Result<ArtifactRef, StorageError> {
    let mut attempt = 1;
    loop {
        let result = match store.put(key, data, "video/mp4").await {
            Ok(()) => store.url_for(key).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(url) => {
                return Ok(ArtifactRef {
                    object_key: key.to_string(),
                    url,
                })
            }
            Err(e) if attempt < policy.max_attempts => {
                let delay = policy.backoff(attempt);
                tracing::warn!(
                    key,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Artifact upload failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                tracing::error!(key, attempt, error = %e, "Artifact upload failed permanently");
                return Err(e);
            }
        }
    }
}

/// Client for S3-compatible object storage (R2, S3, MinIO).
pub struct S3ArtifactStore {
    bucket: Box<Bucket>,
    public_base_url: Option<String>,
    url_ttl_secs: u32,
}

impl S3ArtifactStore {
    pub fn new(
        bucket_name: &str,
        endpoint: &str,
        region: &str,
        access_key: &str,
        secret_key: &str,
    ) -> Result<Self, StorageError> {
        let region = Region::Custom {
            region: region.to_string(),
            endpoint: endpoint.to_string(),
        };

        let credentials =
            Credentials::new(Some(access_key), Some(secret_key), None, None, None)
                .map_err(|e| StorageError::Config(e.to_string()))?;

        let bucket = Bucket::new(bucket_name, region, credentials)
            .map_err(|e| StorageError::Config(e.to_string()))?
            .with_path_style();

        Ok(Self {
            bucket,
            public_base_url: None,
            url_ttl_secs: 7 * 24 * 60 * 60,
        })
    }

    /// Serve artifacts from a public base URL instead of presigned links.
    pub fn with_public_base_url(mut self, base: Option<String>) -> Self {
        self.public_base_url = base.map(|b| b.trim_end_matches('/').to_string());
        self
    }

    pub fn with_url_ttl(mut self, ttl: Duration) -> Self {
        self.url_ttl_secs = u32::try_from(ttl.as_secs()).unwrap_or(u32::MAX);
        self
    }
}

#[async_trait]
impl ArtifactStore for S3ArtifactStore {
    async fn put(&self, key: &str, data: &[u8], content_type: &str) -> Result<(), StorageError> {
        let response = self
            .bucket
            .put_object_with_content_type(key, data, content_type)
            .await
            .map_err(StorageError::S3)?;

        let code = response.status_code();
        if !(200..300).contains(&code) {
            return Err(StorageError::Rejected(code));
        }
        Ok(())
    }

    async fn url_for(&self, key: &str) -> Result<String, StorageError> {
        match &self.public_base_url {
            Some(base) => Ok(format!("{base}/{key}")),
            None => self
                .bucket
                .presign_get(key, self.url_ttl_secs, None)
                .await
                .map_err(StorageError::S3),
        }
    }
}

/// Process-local artifact store for tests and local development.
#[derive(Default)]
pub struct InMemoryArtifactStore {
    objects: RwLock<HashMap<String, Vec<u8>>>,
}

impl InMemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.read().await.get(key).cloned()
    }

    pub async fn object_count(&self) -> usize {
        self.objects.read().await.len()
    }
}

#[async_trait]
impl ArtifactStore for InMemoryArtifactStore {
    async fn put(&self, key: &str, data: &[u8], _content_type: &str) -> Result<(), StorageError> {
        self.objects
            .write()
            .await
            .insert(key.to_string(), data.to_vec());
        Ok(())
    }

    async fn url_for(&self, key: &str) -> Result<String, StorageError> {
        Ok(format!("memory://artifacts/{key}"))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("S3 operation failed: {0}")]
    S3(#[from] s3::error::S3Error),

    #[error("Storage rejected upload with status {0}")]
    Rejected(u16),

    #[error("Storage configuration error: {0}")]
    Config(String),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first `failures` puts.
    struct FlakyStore {
        inner: InMemoryArtifactStore,
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl ArtifactStore for FlakyStore {
        async fn put(&self, key: &str, data: &[u8], ct: &str) -> Result<(), StorageError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(StorageError::Unavailable("connection reset".to_string()));
            }
            self.inner.put(key, data, ct).await
        }

        async fn url_for(&self, key: &str) -> Result<String, StorageError> {
            self.inner.url_for(key).await
        }
    }

    fn flaky(failures: u32) -> FlakyStore {
        FlakyStore {
            inner: InMemoryArtifactStore::new(),
            failures,
            calls: AtomicU32::new(0),
        }
    }

    #[test]
    fn key_is_dated_and_stable() {
        let at = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        assert_eq!(artifact_key("job-1", at), "videos/2023/11/14/job-1.mp4");
        assert_eq!(artifact_key("job-1", at), artifact_key("job-1", at));
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let store = flaky(2);
        let policy = RetryPolicy::new(3, Duration::from_millis(1));

        let artifact = upload_with_retry(&store, &policy, "videos/a.mp4", b"mp4")
            .await
            .unwrap();

        assert_eq!(artifact.object_key, "videos/a.mp4");
        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
        assert_eq!(store.inner.get("videos/a.mp4").await.unwrap(), b"mp4");
    }

    #[tokio::test]
    async fn attempts_are_bounded() {
        let store = flaky(10);
        let policy = RetryPolicy::new(3, Duration::from_millis(1));

        let err = upload_with_retry(&store, &policy, "videos/a.mp4", b"mp4")
            .await
            .unwrap_err();

        assert!(matches!(err, StorageError::Unavailable(_)));
        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
    }
}
