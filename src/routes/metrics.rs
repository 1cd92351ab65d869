use axum::extract::State;
use axum::response::IntoResponse;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::Arc;

/// Install the global Prometheus recorder and describe the gateway's metrics.
pub fn install_recorder() -> Result<Arc<PrometheusHandle>, metrics_exporter_prometheus::BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    metrics::describe_counter!("generation_jobs_submitted", "Generation jobs accepted");
    metrics::describe_counter!("generation_jobs_completed", "Generation jobs completed");
    metrics::describe_counter!(
        "generation_jobs_failed",
        "Generation jobs failed, by error category"
    );
    metrics::describe_histogram!(
        "generation_seconds",
        "Model-reported generation time of completed jobs"
    );
    metrics::describe_counter!("rate_limited_requests", "Submissions rejected by the rate limiter");
    metrics::describe_counter!("webhook_deliveries", "Webhook delivery outcomes");
    metrics::describe_gauge!("generation_queue_depth", "Jobs waiting in the Redis queue");

    Ok(Arc::new(handle))
}

/// GET /metrics: Prometheus text exposition.
pub async fn prometheus_metrics(State(handle): State<Arc<PrometheusHandle>>) -> impl IntoResponse {
    handle.render()
}
