use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing_subscriber::EnvFilter;

use videogen_gateway::bootstrap::{self, Backends};
use videogen_gateway::config::AppConfig;
use videogen_gateway::services::{
    orchestrator::Orchestrator,
    queue::{JobQueue, QueueError},
    runner::GenerationRunner,
};

const POLL_INTERVAL_MS: u64 = 1000;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting generation worker");

    let config = AppConfig::from_env().expect("Failed to load configuration");
    if config.database_url.is_none() {
        panic!("DATABASE_URL is required: the worker shares the job store with the API");
    }
    let redis_url = config
        .redis_url
        .clone()
        .expect("REDIS_URL is required for the worker");

    let backends = Backends::connect(&config)
        .await
        .expect("Failed to initialize persistence");
    let artifacts =
        bootstrap::artifact_store(&config).expect("Failed to initialize artifact storage");
    let queue = Arc::new(JobQueue::new(&redis_url).expect("Failed to initialize job queue"));
    let notifier = bootstrap::notifier(&config, backends.jobs.clone());

    let orchestrator = Orchestrator::new(
        backends.jobs.clone(),
        artifacts,
        queue.clone(),
        notifier,
        bootstrap::upload_policy(&config),
    );

    let generation_timeout = Duration::from_secs(config.generation_timeout_secs);
    let runner = GenerationRunner::new(
        orchestrator,
        Arc::new(bootstrap::inference_client(&config).expect("Failed to initialize inference client")),
        bootstrap::image_fetcher(&config),
        generation_timeout,
    );

    let housekeeping_every = Duration::from_secs(config.stale_job_check_secs);
    let requeue_after = Duration::from_secs(config.queued_requeue_secs.max(0) as u64);
    let mut last_housekeeping: Option<Instant> = None;

    tracing::info!("Worker ready, starting job processing loop");

    loop {
        if last_housekeeping.map_or(true, |at| at.elapsed() >= housekeeping_every) {
            housekeeping(&runner, &queue, requeue_after, generation_timeout * 2).await;
            last_housekeeping = Some(Instant::now());
        }

        match process_next_job(&runner, &queue).await {
            Ok(true) => {
                tracing::debug!("Job processed, checking for next job");
            }
            Ok(false) => {
                tracing::trace!("No jobs available, sleeping");
                sleep(Duration::from_millis(POLL_INTERVAL_MS)).await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Queue error, will retry");
                sleep(Duration::from_millis(POLL_INTERVAL_MS)).await;
            }
        }
    }
}

/// Process one job from the queue. Returns `Ok(false)` when the queue is empty.
async fn process_next_job(runner: &GenerationRunner, queue: &JobQueue) -> Result<bool, QueueError> {
    let Some(queued) = queue.dequeue().await? else {
        return Ok(false);
    };

    tracing::info!(job_id = %queued.job_id, "Dequeued job");

    if let Err(e) = runner.run(&queued.job_id).await {
        // The job record is authoritative; the sweeps recover anything left behind.
        tracing::error!(job_id = %queued.job_id, error = %e, "Generation run failed");
    }

    queue.complete(&queued).await?;
    Ok(true)
}

async fn housekeeping(
    runner: &GenerationRunner,
    queue: &JobQueue,
    requeue_after: Duration,
    stall_after: Duration,
) {
    match queue.queue_depth().await {
        Ok(depth) => {
            metrics::gauge!("generation_queue_depth").set(depth as f64);
            // Only an empty queue proves old queued jobs were lost.
            if depth == 0 {
                if let Err(e) = runner.requeue_stale(queue, requeue_after).await {
                    tracing::warn!(error = %e, "Requeue sweep failed");
                }
            }
        }
        Err(e) => tracing::warn!(error = %e, "Could not read queue depth"),
    }

    if let Err(e) = runner.expire_stalled(stall_after).await {
        tracing::warn!(error = %e, "Stalled job sweep failed");
    }
}
