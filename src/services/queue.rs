use async_trait::async_trait;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

const QUEUE_KEY: &str = "videogen:jobs";
const PROCESSING_KEY: &str = "videogen:processing";

/// Hands accepted jobs to whatever runs generation.
#[async_trait]
pub trait JobDispatch: Send + Sync {
    async fn dispatch(&self, job_id: &str) -> Result<(), QueueError>;
}

/// Job payload serialized into Redis. The job record is the source of truth,
/// so only the id travels.
#[derive(Debug, Serialize, Deserialize)]
pub struct QueuedJob {
    pub job_id: String,
}

/// Redis-backed job queue shared by the API and the worker.
pub struct JobQueue {
    client: redis::Client,
}

impl JobQueue {
    pub fn new(redis_url: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self { client })
    }

    pub async fn enqueue(&self, job: &QueuedJob) -> Result<(), QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let payload = serde_json::to_string(job)?;
        conn.lpush::<_, _, ()>(QUEUE_KEY, &payload).await?;
        Ok(())
    }

    /// Pop the next job, moving it onto the processing list.
    pub async fn dequeue(&self) -> Result<Option<QueuedJob>, QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let result: Option<String> = conn.rpoplpush(QUEUE_KEY, PROCESSING_KEY).await?;

        match result {
            Some(payload) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }

    /// Remove a job from the processing list once the worker is done with it.
    pub async fn complete(&self, job: &QueuedJob) -> Result<(), QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let payload = serde_json::to_string(job)?;
        conn.lrem::<_, _, ()>(PROCESSING_KEY, 1, &payload).await?;
        Ok(())
    }

    pub async fn health_check(&self) -> Result<(), QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }

    /// Number of jobs waiting to be picked up.
    pub async fn queue_depth(&self) -> Result<u64, QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let depth: u64 = conn.llen(QUEUE_KEY).await?;
        Ok(depth)
    }
}

#[async_trait]
impl JobDispatch for JobQueue {
    async fn dispatch(&self, job_id: &str) -> Result<(), QueueError> {
        self.enqueue(&QueuedJob {
            job_id: job_id.to_string(),
        })
        .await
    }
}

/// In-process dispatch for deployments without Redis. The receiving half is
/// drained by a background generation task.
#[derive(Clone)]
pub struct LocalDispatch {
    tx: mpsc::UnboundedSender<String>,
}

impl LocalDispatch {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl JobDispatch for LocalDispatch {
    async fn dispatch(&self, job_id: &str) -> Result<(), QueueError> {
        self.tx
            .send(job_id.to_string())
            .map_err(|_| QueueError::Closed)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Generation task is not running")]
    Closed,
}
