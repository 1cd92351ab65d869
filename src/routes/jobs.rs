use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;

use crate::app_state::AppState;
use crate::models::credential::Credential;
use crate::models::generation::{
    GenerateRequest, GenerateResponse, JobStatusResponse, JobSummary, ListJobsQuery,
};
use crate::routes::error::ApiError;
use crate::services::rate_limit::RateDecision;
use crate::services::validation::ValidationError;

pub const API_KEY_HEADER: &str = "x-api-key";

const DEFAULT_LIST_LIMIT: i64 = 20;
const MAX_LIST_LIMIT: i64 = 100;

async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<Credential, ApiError> {
    let presented = headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim);
    let credential = state.authenticator.authenticate(presented).await?;
    state.authenticator.record_usage(&credential);
    Ok(credential)
}

/// POST /api/v1/generate: accept an image-to-video job.
pub async fn submit_generation(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<GenerateRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<GenerateResponse>), ApiError> {
    let credential = authenticate(&state, &headers).await?;

    if let RateDecision::Limited { retry_after_secs } =
        state.rate_limiter.check_and_record(&credential).await?
    {
        return Err(ApiError::RateLimited { retry_after_secs });
    }

    let Json(request) =
        payload.map_err(|e| ValidationError::new("body", e.body_text()))?;
    let validated = state.validator.validate(&request).await.map_err(|e| {
        tracing::info!(credential_id = %credential.id, field = %e.field, reason = %e.reason, "Rejected generation request");
        e
    })?;

    let job = state.orchestrator.submit(validated, &credential).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(GenerateResponse {
            job_id: job.id,
            status: job.status,
            message: "Job queued for generation".to_string(),
        }),
    ))
}

/// GET /api/v1/jobs/{job_id}: status of one of the caller's jobs.
pub async fn get_job_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(job_id): Path<String>,
) -> Result<Json<JobStatusResponse>, ApiError> {
    let credential = authenticate(&state, &headers).await?;
    let job = state
        .orchestrator
        .get_for_credential(&job_id, &credential)
        .await?;
    Ok(Json(job.into()))
}

/// GET /api/v1/jobs: the caller's most recent jobs, newest first.
pub async fn list_jobs(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ListJobsQuery>,
) -> Result<Json<Vec<JobSummary>>, ApiError> {
    let credential = authenticate(&state, &headers).await?;
    let limit = query
        .limit
        .unwrap_or(DEFAULT_LIST_LIMIT)
        .clamp(1, MAX_LIST_LIMIT);

    let jobs = state
        .orchestrator
        .list_for_credential(&credential, query.status, limit)
        .await?;
    Ok(Json(jobs.iter().map(JobSummary::from).collect()))
}
