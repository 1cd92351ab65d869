use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::models::job::{ErrorCategory, JobStatus};
use crate::services::inference::{ImageFetcher, VideoGenerator};
use crate::services::job_store::Transition;
use crate::services::orchestrator::{Orchestrator, OrchestratorError};
use crate::services::queue::JobDispatch;

/// Jobs examined per housekeeping pass.
const SWEEP_BATCH: i64 = 100;

/// Executes queued jobs against the external generator.
#[derive(Clone)]
pub struct GenerationRunner {
    orchestrator: Orchestrator,
    generator: Arc<dyn VideoGenerator>,
    fetcher: Arc<ImageFetcher>,
    timeout: Duration,
}

impl GenerationRunner {
    pub fn new(
        orchestrator: Orchestrator,
        generator: Arc<dyn VideoGenerator>,
        fetcher: ImageFetcher,
        timeout: Duration,
    ) -> Self {
        Self {
            orchestrator,
            generator,
            fetcher: Arc::new(fetcher),
            timeout,
        }
    }

    /// Run one job to a terminal state. Jobs already started elsewhere, or
    /// already finished, are skipped without running generation.
    pub async fn run(&self, job_id: &str) -> Result<(), OrchestratorError> {
        let job = match self.orchestrator.on_generation_start(job_id).await {
            Ok(Transition::Applied(job)) => job,
            Ok(Transition::Unchanged(_)) => {
                tracing::info!(job_id, "Job already started, skipping duplicate delivery");
                return Ok(());
            }
            Err(OrchestratorError::Inconsistent { current, .. }) => {
                tracing::info!(job_id, status = %current, "Job no longer queued, skipping");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let image = match self.fetcher.fetch(&job.params.image).await {
            Ok(bytes) => bytes,
            Err(e) => {
                self.orchestrator
                    .on_generation_failure(job_id, e.category(), e.to_string())
                    .await?;
                return Ok(());
            }
        };

        let started = std::time::Instant::now();
        let outcome = tokio::time::timeout(self.timeout, self.generator.generate(&job.params, &image)).await;

        match outcome {
            Ok(Ok(video)) => {
                tracing::info!(
                    job_id,
                    generation_seconds = video.generation_seconds,
                    wall_ms = started.elapsed().as_millis() as u64,
                    bytes = video.bytes.len(),
                    "Generation finished"
                );
                self.orchestrator
                    .on_generation_success(job_id, &video.bytes, video.generation_seconds)
                    .await?;
            }
            Ok(Err(e)) => {
                self.orchestrator
                    .on_generation_failure(job_id, e.category(), e.to_string())
                    .await?;
            }
            Err(_) => {
                self.orchestrator
                    .on_generation_failure(
                        job_id,
                        ErrorCategory::Timeout,
                        format!("generation exceeded {}s", self.timeout.as_secs()),
                    )
                    .await?;
            }
        }
        Ok(())
    }

    /// Drain an in-process dispatch channel, one job at a time.
    pub async fn drain(self, mut rx: mpsc::UnboundedReceiver<String>) {
        while let Some(job_id) = rx.recv().await {
            if let Err(e) = self.run(&job_id).await {
                tracing::error!(job_id = %job_id, error = %e, "Generation run failed");
            }
        }
        tracing::info!("Dispatch channel closed, generation task exiting");
    }

    /// Hand queued jobs older than `older_than` to `dispatch` again.
    /// Duplicates are harmless because starting a job is compare-and-set.
    pub async fn requeue_stale(
        &self,
        dispatch: &dyn JobDispatch,
        older_than: Duration,
    ) -> Result<usize, OrchestratorError> {
        let before = Utc::now() - to_chrono(older_than);
        let stale = self
            .orchestrator
            .jobs()
            .list_stale(JobStatus::Queued, before, SWEEP_BATCH)
            .await?;

        let mut requeued = 0;
        for job in &stale {
            match dispatch.dispatch(&job.id).await {
                Ok(()) => requeued += 1,
                Err(e) => tracing::warn!(job_id = %job.id, error = %e, "Requeue failed"),
            }
        }
        if requeued > 0 {
            tracing::info!(requeued, "Requeued stale jobs");
        }
        Ok(requeued)
    }

    /// Fail jobs stuck in `processing` for longer than `older_than`, e.g.
    /// after a worker crash. Generation is not retried.
    pub async fn expire_stalled(&self, older_than: Duration) -> Result<usize, OrchestratorError> {
        let before = Utc::now() - to_chrono(older_than);
        let stalled = self
            .orchestrator
            .jobs()
            .list_stale(JobStatus::Processing, before, SWEEP_BATCH)
            .await?;

        let mut expired = 0;
        for job in &stalled {
            let result = self
                .orchestrator
                .on_generation_failure(
                    &job.id,
                    ErrorCategory::Timeout,
                    format!("no result within {}s of start", older_than.as_secs()),
                )
                .await;
            match result {
                Ok(t) if t.was_applied() => expired += 1,
                Ok(_) => {}
                Err(e) => tracing::warn!(job_id = %job.id, error = %e, "Could not expire stalled job"),
            }
        }
        if expired > 0 {
            tracing::warn!(expired, "Expired stalled jobs");
        }
        Ok(expired)
    }
}

fn to_chrono(d: Duration) -> ChronoDuration {
    ChronoDuration::from_std(d).unwrap_or(ChronoDuration::MAX)
}
