use axum::routing::{get, post};
use axum::Router;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::app_state::AppState;

pub mod error;
pub mod health;
pub mod jobs;
pub mod metrics;

/// API routes with the shared middleware stack. `/metrics` is attached by
/// the binary, which owns the recorder.
pub fn router(state: AppState, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/api/v1/generate", post(jobs::submit_generation))
        .route("/api/v1/jobs", get(jobs::list_jobs))
        .route("/api/v1/jobs/{job_id}", get(jobs::get_job_status))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
}
