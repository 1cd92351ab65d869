use axum::routing::get;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use videogen_gateway::app_state::AppState;
use videogen_gateway::bootstrap::{self, Backends};
use videogen_gateway::config::AppConfig;
use videogen_gateway::routes;
use videogen_gateway::services::{
    auth::Authenticator,
    orchestrator::Orchestrator,
    queue::{JobDispatch, JobQueue, LocalDispatch},
    rate_limit::RateLimiter,
    runner::GenerationRunner,
    validation::{InputValidator, SystemResolver},
};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing videogen-gateway");

    let prometheus_handle =
        routes::metrics::install_recorder().expect("Failed to install Prometheus metrics recorder");

    let backends = Backends::connect(&config)
        .await
        .expect("Failed to initialize persistence");
    let artifacts =
        bootstrap::artifact_store(&config).expect("Failed to initialize artifact storage");
    let notifier = bootstrap::notifier(&config, backends.jobs.clone());

    // Redis dispatch needs a shared job store; otherwise generation runs here.
    let mut queue = None;
    let mut local_rx = None;
    let dispatch: Arc<dyn JobDispatch> = match (&config.redis_url, &backends.pool) {
        (Some(url), Some(_)) => {
            tracing::info!("Dispatching generation through Redis");
            let q = Arc::new(JobQueue::new(url).expect("Failed to initialize job queue"));
            queue = Some(q.clone());
            q
        }
        (redis_url, _) => {
            if redis_url.is_some() {
                tracing::warn!("REDIS_URL ignored without DATABASE_URL, generating in-process");
            }
            let (local, rx) = LocalDispatch::channel();
            local_rx = Some(rx);
            Arc::new(local)
        }
    };

    let orchestrator = Orchestrator::new(
        backends.jobs.clone(),
        artifacts,
        dispatch,
        notifier,
        bootstrap::upload_policy(&config),
    );

    if let Some(rx) = local_rx {
        let inference = bootstrap::inference_client(&config)
            .expect("Failed to initialize inference client");
        let generation_timeout = Duration::from_secs(config.generation_timeout_secs);
        let runner = GenerationRunner::new(
            orchestrator.clone(),
            Arc::new(inference),
            bootstrap::image_fetcher(&config),
            generation_timeout,
        );

        let sweeper = runner.clone();
        let check_every = Duration::from_secs(config.stale_job_check_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(check_every);
            loop {
                ticker.tick().await;
                if let Err(e) = sweeper.expire_stalled(generation_timeout * 2).await {
                    tracing::warn!(error = %e, "Stalled job sweep failed");
                }
            }
        });

        tokio::spawn(runner.drain(rx));
        tracing::info!("In-process generation task started");
    }

    let rate_limiter = RateLimiter::new(backends.rate_limits.clone());
    tokio::spawn(
        rate_limiter
            .clone()
            .run_sweeper(Duration::from_secs(config.rate_limit_sweep_secs)),
    );

    let validator = InputValidator::new(
        config.limits.clone(),
        bootstrap::image_root(&config),
        Arc::new(SystemResolver),
    );

    let mut state = AppState::new(
        Authenticator::new(backends.credentials.clone()),
        rate_limiter,
        validator,
        orchestrator,
    );
    if let Some(pool) = backends.pool.clone() {
        state = state.with_database(pool);
    }
    if let Some(q) = queue {
        let depth_queue = q.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(15));
            loop {
                ticker.tick().await;
                match depth_queue.queue_depth().await {
                    Ok(depth) => metrics::gauge!("generation_queue_depth").set(depth as f64),
                    Err(e) => tracing::debug!(error = %e, "Could not read queue depth"),
                }
            }
        });
        state = state.with_queue(q);
    }

    let app = routes::router(state, config.max_body_bytes).route(
        "/metrics",
        get(routes::metrics::prometheus_metrics).with_state(prometheus_handle),
    );

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app).await.expect("Server error");
}
