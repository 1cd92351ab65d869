use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::services::auth::AuthError;
use crate::services::orchestrator::OrchestratorError;
use crate::services::rate_limit::RateLimitError;
use crate::services::validation::ValidationError;

/// Errors surfaced to API callers.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("Rate limit exceeded, retry in {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Job '{0}' already exists")]
    Conflict(String),

    #[error("Job '{0}' not found")]
    NotFound(String),

    #[error("Service temporarily unavailable")]
    Unavailable(String),

    #[error("Internal server error")]
    Internal(String),
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    field: Option<&'a str>,
}

impl From<RateLimitError> for ApiError {
    fn from(e: RateLimitError) -> Self {
        ApiError::Unavailable(e.to_string())
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(e: OrchestratorError) -> Self {
        match e {
            OrchestratorError::Conflict(id) => ApiError::Conflict(id),
            OrchestratorError::NotFound(id) => ApiError::NotFound(id),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Auth(AuthError::Unavailable(_)) | ApiError::Unavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ApiError::Auth(_) => StatusCode::UNAUTHORIZED,
            ApiError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        match &self {
            ApiError::Auth(AuthError::Unavailable(detail))
            | ApiError::Unavailable(detail)
            | ApiError::Internal(detail) => {
                tracing::error!(status = status.as_u16(), detail = %detail, "Request failed");
            }
            _ => {}
        }

        let body = ErrorBody {
            error: match &self {
                ApiError::Validation(v) => v.reason.clone(),
                other => other.to_string(),
            },
            field: match &self {
                ApiError::Validation(v) => Some(v.field.as_str()),
                _ => None,
            },
        };
        let mut response = (status, Json(body)).into_response();

        let headers = response.headers_mut();
        match &self {
            ApiError::Auth(AuthError::Unavailable(_)) => {}
            ApiError::Auth(_) => {
                headers.insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("ApiKey"));
            }
            ApiError::RateLimited { retry_after_secs } => {
                headers.insert(header::RETRY_AFTER, HeaderValue::from(*retry_after_secs));
            }
            _ => {}
        }
        response
    }
}
