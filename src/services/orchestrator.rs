use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

use crate::models::credential::Credential;
use crate::models::job::{
    ErrorCategory, GenerationJob, JobError, JobOutput, JobStatus, JobUpdate,
};
use crate::services::job_store::{JobStore, JobStoreError, Transition};
use crate::services::queue::JobDispatch;
use crate::services::retry::RetryPolicy;
use crate::services::storage::{artifact_key, upload_with_retry, ArtifactStore};
use crate::services::validation::ValidatedInput;
use crate::services::webhook::Notifier;

/// Drives jobs through `queued -> processing -> completed | failed`.
///
/// All status changes go through the job store's compare-and-set, so each
/// terminal state is applied once no matter how many signals arrive. Only the
/// caller that applied a terminal transition notifies the webhook.
#[derive(Clone)]
pub struct Orchestrator {
    jobs: Arc<dyn JobStore>,
    artifacts: Arc<dyn ArtifactStore>,
    dispatch: Arc<dyn JobDispatch>,
    notifier: Arc<dyn Notifier>,
    upload_policy: RetryPolicy,
    completions: CompletionLocks,
}

impl Orchestrator {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        artifacts: Arc<dyn ArtifactStore>,
        dispatch: Arc<dyn JobDispatch>,
        notifier: Arc<dyn Notifier>,
        upload_policy: RetryPolicy,
    ) -> Self {
        Self {
            jobs,
            artifacts,
            dispatch,
            notifier,
            upload_policy,
            completions: CompletionLocks::default(),
        }
    }

    pub fn jobs(&self) -> &Arc<dyn JobStore> {
        &self.jobs
    }

    /// Persist a validated request as a queued job and hand it to generation.
    ///
    /// The job is durable before dispatch. A dispatch failure is logged and
    /// left for the requeue sweep; the caller still gets the queued job.
    pub async fn submit(
        &self,
        input: ValidatedInput,
        credential: &Credential,
    ) -> Result<GenerationJob, OrchestratorError> {
        let job_id = input
            .job_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let job = GenerationJob::queued(job_id, credential.id, input.params, input.webhook);

        self.jobs.create(&job).await?;
        metrics::counter!("generation_jobs_submitted").increment(1);

        tracing::info!(
            job_id = %job.id,
            credential_id = %credential.id,
            width = job.params.width,
            height = job.params.height,
            num_frames = job.params.num_frames,
            has_webhook = job.webhook.is_some(),
            "Job queued"
        );

        if let Err(e) = self.dispatch.dispatch(&job.id).await {
            tracing::error!(job_id = %job.id, error = %e, "Failed to dispatch job, leaving for requeue");
        }

        Ok(job)
    }

    /// Fetch a job on behalf of its owner. Other credentials see `NotFound`.
    pub async fn get_for_credential(
        &self,
        job_id: &str,
        credential: &Credential,
    ) -> Result<GenerationJob, OrchestratorError> {
        let job = self.jobs.get(job_id).await?;
        if job.credential_id != credential.id {
            return Err(OrchestratorError::NotFound(job_id.to_string()));
        }
        Ok(job)
    }

    pub async fn list_for_credential(
        &self,
        credential: &Credential,
        status: Option<JobStatus>,
        limit: i64,
    ) -> Result<Vec<GenerationJob>, OrchestratorError> {
        Ok(self
            .jobs
            .list_for_credential(credential.id, status, limit)
            .await?)
    }

    /// `queued -> processing`. `Unchanged` means another executor already
    /// started this job and the caller must not run generation.
    pub async fn on_generation_start(&self, job_id: &str) -> Result<Transition, OrchestratorError> {
        let transition = self
            .jobs
            .transition(job_id, JobStatus::Queued, JobUpdate::Start)
            .await?;
        if transition.was_applied() {
            tracing::info!(job_id, "Generation started");
        }
        Ok(transition)
    }

    /// Upload the artifact and complete the job. Upload failure fails the job
    /// with `storage-failure`.
    ///
    /// Success signals for one job are serialized in this process, so a
    /// duplicate waits for the first and then sees the completed job. A
    /// duplicate with the same duration is `Unchanged` and uploads nothing;
    /// one with a different duration is `Inconsistent`.
    pub async fn on_generation_success(
        &self,
        job_id: &str,
        video: &[u8],
        generation_seconds: f64,
    ) -> Result<Transition, OrchestratorError> {
        let _claim = self.completions.acquire(job_id).await;

        let job = self.jobs.get(job_id).await?;
        match job.status {
            JobStatus::Processing => {}
            JobStatus::Completed => {
                let repeat = JobUpdate::Complete(JobOutput {
                    url: String::new(),
                    object_key: artifact_key(&job.id, job.created_at),
                    generation_seconds,
                });
                if repeat.already_applied(&job) {
                    tracing::info!(job_id, "Duplicate completion signal ignored");
                    return Ok(Transition::Unchanged(job));
                }
                tracing::warn!(job_id, generation_seconds, "Conflicting completion signal for completed job");
                return Err(OrchestratorError::Inconsistent {
                    job_id: job_id.to_string(),
                    expected: JobStatus::Processing,
                    current: JobStatus::Completed,
                });
            }
            other => {
                tracing::warn!(job_id, status = %other, "Completion signal for job not processing");
                return Err(OrchestratorError::Inconsistent {
                    job_id: job_id.to_string(),
                    expected: JobStatus::Processing,
                    current: other,
                });
            }
        }

        let key = artifact_key(&job.id, job.created_at);
        let update = match upload_with_retry(self.artifacts.as_ref(), &self.upload_policy, &key, video)
            .await
        {
            Ok(artifact) => JobUpdate::Complete(JobOutput {
                url: artifact.url,
                object_key: artifact.object_key,
                generation_seconds,
            }),
            Err(e) => JobUpdate::Fail(JobError {
                category: ErrorCategory::StorageFailure,
                message: format!("artifact upload failed: {e}"),
            }),
        };

        self.finish(job_id, update).await
    }

    /// `processing -> failed` with the given category.
    pub async fn on_generation_failure(
        &self,
        job_id: &str,
        category: ErrorCategory,
        message: impl Into<String>,
    ) -> Result<Transition, OrchestratorError> {
        let update = JobUpdate::Fail(JobError {
            category,
            message: message.into(),
        });
        self.finish(job_id, update).await
    }

    async fn finish(&self, job_id: &str, update: JobUpdate) -> Result<Transition, OrchestratorError> {
        let transition = self
            .jobs
            .transition(job_id, JobStatus::Processing, update)
            .await?;

        let Transition::Applied(job) = &transition else {
            tracing::debug!(job_id, "Terminal state already recorded");
            return Ok(transition);
        };

        match (&job.output, &job.error) {
            (Some(output), _) => {
                metrics::counter!("generation_jobs_completed").increment(1);
                metrics::histogram!("generation_seconds").record(output.generation_seconds);
                tracing::info!(
                    job_id,
                    object_key = %output.object_key,
                    generation_seconds = output.generation_seconds,
                    "Job completed"
                );
            }
            (None, Some(error)) => {
                metrics::counter!("generation_jobs_failed", "category" => error.category.to_string())
                    .increment(1);
                tracing::warn!(
                    job_id,
                    category = %error.category,
                    message = %error.message,
                    "Job failed"
                );
            }
            (None, None) => {}
        }

        if job.webhook.is_some() {
            self.notifier.notify(job.clone());
        }
        Ok(transition)
    }
}

/// Per-job async locks, created on demand and dropped once nobody holds or
/// waits on them.
#[derive(Clone, Default)]
struct CompletionLocks {
    inner: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl CompletionLocks {
    async fn acquire(&self, job_id: &str) -> CompletionClaim {
        let lock = self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(job_id.to_string())
            .or_default()
            .clone();
        let guard = lock.clone().lock_owned().await;
        CompletionClaim {
            locks: self.clone(),
            job_id: job_id.to_string(),
            lock,
            guard: Some(guard),
        }
    }
}

struct CompletionClaim {
    locks: CompletionLocks,
    job_id: String,
    lock: Arc<tokio::sync::Mutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for CompletionClaim {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = self.locks.inner.lock().unwrap_or_else(PoisonError::into_inner);
        // The map and this claim are the only holders: no one is waiting.
        if Arc::strong_count(&self.lock) == 2 {
            locks.remove(&self.job_id);
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Job '{0}' already exists")]
    Conflict(String),

    #[error("Job '{0}' not found")]
    NotFound(String),

    #[error("Job '{job_id}' is {current}, expected {expected}")]
    Inconsistent {
        job_id: String,
        expected: JobStatus,
        current: JobStatus,
    },

    #[error("Job store error: {0}")]
    Store(JobStoreError),
}

impl From<JobStoreError> for OrchestratorError {
    fn from(e: JobStoreError) -> Self {
        match e {
            JobStoreError::Conflict(id) => OrchestratorError::Conflict(id),
            JobStoreError::NotFound(id) => OrchestratorError::NotFound(id),
            JobStoreError::StaleState {
                job_id,
                expected,
                current,
            } => OrchestratorError::Inconsistent {
                job_id,
                expected,
                current,
            },
            other => OrchestratorError::Store(other),
        }
    }
}
