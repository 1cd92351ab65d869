use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::db::queries;
use crate::models::job::{GenerationJob, JobStatus, JobUpdate};

/// Outcome of a successful compare-and-set transition.
#[derive(Debug, Clone)]
pub enum Transition {
    /// This call moved the job to the new state.
    Applied(GenerationJob),
    /// The job was already in the requested state with identical fields.
    Unchanged(GenerationJob),
}

impl Transition {
    pub fn job(&self) -> &GenerationJob {
        match self {
            Transition::Applied(job) | Transition::Unchanged(job) => job,
        }
    }

    pub fn into_job(self) -> GenerationJob {
        match self {
            Transition::Applied(job) | Transition::Unchanged(job) => job,
        }
    }

    pub fn was_applied(&self) -> bool {
        matches!(self, Transition::Applied(_))
    }
}

/// Durable record of submitted jobs.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new job. Fails with `Conflict` if the id is taken.
    async fn create(&self, job: &GenerationJob) -> Result<String, JobStoreError>;

    async fn get(&self, job_id: &str) -> Result<GenerationJob, JobStoreError>;

    /// Move the job from `from` to the target of `update`, only if it is
    /// currently in `from`. Repeating an already-applied update succeeds
    /// with `Transition::Unchanged`.
    async fn transition(
        &self,
        job_id: &str,
        from: JobStatus,
        update: JobUpdate,
    ) -> Result<Transition, JobStoreError>;

    /// Delivery bookkeeping only; never touches status, output or error.
    async fn record_webhook_attempt(
        &self,
        job_id: &str,
        attempts: i32,
        delivered: bool,
        at: DateTime<Utc>,
    ) -> Result<(), JobStoreError>;

    async fn list_for_credential(
        &self,
        credential_id: Uuid,
        status: Option<JobStatus>,
        limit: i64,
    ) -> Result<Vec<GenerationJob>, JobStoreError>;

    /// Jobs in `status` whose last state change predates `before`.
    async fn list_stale(
        &self,
        status: JobStatus,
        before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<GenerationJob>, JobStoreError>;
}

/// Resolve a failed compare-and-set against the job's actual state.
fn settle(
    current: GenerationJob,
    from: JobStatus,
    update: &JobUpdate,
) -> Result<Transition, JobStoreError> {
    if update.already_applied(&current) {
        return Ok(Transition::Unchanged(current));
    }
    Err(JobStoreError::StaleState {
        job_id: current.id,
        expected: from,
        current: current.status,
    })
}

/// Job store backed by PostgreSQL.
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn create(&self, job: &GenerationJob) -> Result<String, JobStoreError> {
        match queries::insert_job(&self.pool, job).await {
            Ok(()) => Ok(job.id.clone()),
            Err(e)
                if e.as_database_error()
                    .is_some_and(|db| db.is_unique_violation()) =>
            {
                Err(JobStoreError::Conflict(job.id.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, job_id: &str) -> Result<GenerationJob, JobStoreError> {
        queries::get_job(&self.pool, job_id)
            .await?
            .ok_or_else(|| JobStoreError::NotFound(job_id.to_string()))
    }

    async fn transition(
        &self,
        job_id: &str,
        from: JobStatus,
        update: JobUpdate,
    ) -> Result<Transition, JobStoreError> {
        if let Some(job) =
            queries::compare_and_set(&self.pool, job_id, from, &update, Utc::now()).await?
        {
            return Ok(Transition::Applied(job));
        }
        let current = self.get(job_id).await?;
        settle(current, from, &update)
    }

    async fn record_webhook_attempt(
        &self,
        job_id: &str,
        attempts: i32,
        delivered: bool,
        at: DateTime<Utc>,
    ) -> Result<(), JobStoreError> {
        queries::record_webhook_attempt(&self.pool, job_id, attempts, delivered, at).await?;
        Ok(())
    }

    async fn list_for_credential(
        &self,
        credential_id: Uuid,
        status: Option<JobStatus>,
        limit: i64,
    ) -> Result<Vec<GenerationJob>, JobStoreError> {
        Ok(queries::list_jobs_for_credential(&self.pool, credential_id, status, limit).await?)
    }

    async fn list_stale(
        &self,
        status: JobStatus,
        before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<GenerationJob>, JobStoreError> {
        Ok(queries::list_stale_jobs(&self.pool, status, before, limit).await?)
    }
}

/// Process-local job store, used when no database is configured and in tests.
#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<String, GenerationJob>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create(&self, job: &GenerationJob) -> Result<String, JobStoreError> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.id) {
            return Err(JobStoreError::Conflict(job.id.clone()));
        }
        jobs.insert(job.id.clone(), job.clone());
        Ok(job.id.clone())
    }

    async fn get(&self, job_id: &str) -> Result<GenerationJob, JobStoreError> {
        self.jobs
            .read()
            .await
            .get(job_id)
            .cloned()
            .ok_or_else(|| JobStoreError::NotFound(job_id.to_string()))
    }

    async fn transition(
        &self,
        job_id: &str,
        from: JobStatus,
        update: JobUpdate,
    ) -> Result<Transition, JobStoreError> {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .get_mut(job_id)
            .ok_or_else(|| JobStoreError::NotFound(job_id.to_string()))?;

        if job.status != from {
            return settle(job.clone(), from, &update);
        }
        update.apply(job, Utc::now());
        Ok(Transition::Applied(job.clone()))
    }

    async fn record_webhook_attempt(
        &self,
        job_id: &str,
        attempts: i32,
        delivered: bool,
        at: DateTime<Utc>,
    ) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .get_mut(job_id)
            .ok_or_else(|| JobStoreError::NotFound(job_id.to_string()))?;
        job.delivery.attempts = attempts;
        job.delivery.delivered = delivered;
        job.delivery.last_attempt_at = Some(at);
        Ok(())
    }

    async fn list_for_credential(
        &self,
        credential_id: Uuid,
        status: Option<JobStatus>,
        limit: i64,
    ) -> Result<Vec<GenerationJob>, JobStoreError> {
        let jobs = self.jobs.read().await;
        let mut owned: Vec<GenerationJob> = jobs
            .values()
            .filter(|j| j.credential_id == credential_id)
            .filter(|j| status.map_or(true, |s| j.status == s))
            .cloned()
            .collect();
        owned.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        owned.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(owned)
    }

    async fn list_stale(
        &self,
        status: JobStatus,
        before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<GenerationJob>, JobStoreError> {
        let jobs = self.jobs.read().await;
        let mut stale: Vec<GenerationJob> = jobs
            .values()
            .filter(|j| j.status == status && j.started_at.unwrap_or(j.created_at) < before)
            .cloned()
            .collect();
        stale.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        stale.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(stale)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum JobStoreError {
    #[error("Job already exists: {0}")]
    Conflict(String),

    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Job {job_id} is {current}, expected {expected}")]
    StaleState {
        job_id: String,
        expected: JobStatus,
        current: JobStatus,
    },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::job::{
        ErrorCategory, GenerationParams, ImageSource, JobError, JobOutput,
    };
    use std::sync::Arc;

    fn job(id: &str) -> GenerationJob {
        GenerationJob::queued(
            id.to_string(),
            Uuid::new_v4(),
            GenerationParams {
                prompt: "test".to_string(),
                image: ImageSource::Remote {
                    url: "https://images.example.com/cat.png".to_string(),
                    pinned_addr: "93.184.216.34".to_string(),
                },
                seed: 42,
                width: 1280,
                height: 720,
                num_frames: 121,
                num_steps: 8,
            },
            None,
        )
    }

    fn output() -> JobOutput {
        JobOutput {
            url: "https://cdn.example.com/videos/j.mp4".to_string(),
            object_key: "videos/j.mp4".to_string(),
            generation_seconds: 41.2,
        }
    }

    async fn processing_store(id: &str) -> InMemoryJobStore {
        let store = InMemoryJobStore::new();
        store.create(&job(id)).await.unwrap();
        store
            .transition(id, JobStatus::Queued, JobUpdate::Start)
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn duplicate_id_conflicts() {
        let store = InMemoryJobStore::new();
        store.create(&job("dup")).await.unwrap();
        let err = store.create(&job("dup")).await.unwrap_err();
        assert!(matches!(err, JobStoreError::Conflict(id) if id == "dup"));
    }

    #[tokio::test]
    async fn missing_job_is_not_found() {
        let store = InMemoryJobStore::new();
        assert!(matches!(store.get("nope").await, Err(JobStoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn identical_terminal_transition_is_idempotent() {
        let store = processing_store("j").await;

        let first = store
            .transition("j", JobStatus::Processing, JobUpdate::Complete(output()))
            .await
            .unwrap();
        let second = store
            .transition("j", JobStatus::Processing, JobUpdate::Complete(output()))
            .await
            .unwrap();

        assert!(first.was_applied());
        assert!(!second.was_applied());
        assert_eq!(second.job().status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn differing_terminal_transition_is_stale() {
        let store = processing_store("j").await;
        store
            .transition("j", JobStatus::Processing, JobUpdate::Complete(output()))
            .await
            .unwrap();
        let before = store.get("j").await.unwrap();

        let err = store
            .transition(
                "j",
                JobStatus::Processing,
                JobUpdate::Fail(JobError {
                    category: ErrorCategory::InferenceError,
                    message: "late failure".to_string(),
                }),
            )
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            JobStoreError::StaleState { current: JobStatus::Completed, .. }
        ));
        assert_eq!(store.get("j").await.unwrap(), before);
    }

    #[tokio::test]
    async fn queued_cannot_jump_to_terminal() {
        let store = InMemoryJobStore::new();
        store.create(&job("j")).await.unwrap();
        let err = store
            .transition("j", JobStatus::Processing, JobUpdate::Complete(output()))
            .await
            .unwrap_err();
        assert!(matches!(err, JobStoreError::StaleState { current: JobStatus::Queued, .. }));
    }

    #[tokio::test]
    async fn concurrent_completions_apply_once() {
        let store = Arc::new(processing_store("race").await);

        let attempts = (0..8).map(|_| {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .transition("race", JobStatus::Processing, JobUpdate::Complete(output()))
                    .await
            })
        });
        let results = futures::future::join_all(attempts).await;

        let applied = results
            .into_iter()
            .map(|r| r.unwrap().unwrap())
            .filter(Transition::was_applied)
            .count();
        assert_eq!(applied, 1);
    }

    #[tokio::test]
    async fn webhook_bookkeeping_leaves_status_alone() {
        let store = processing_store("j").await;
        store
            .record_webhook_attempt("j", 2, false, Utc::now())
            .await
            .unwrap();
        let job = store.get("j").await.unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.delivery.attempts, 2);
        assert!(!job.delivery.delivered);
    }
}
