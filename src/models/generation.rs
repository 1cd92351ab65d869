use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};

use crate::models::job::{GenerationJob, JobError, JobStatus, WebhookDelivery};

fn job_id_charset(value: &Option<String>, _ctx: &()) -> garde::Result {
    match value {
        Some(id) if !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') => {
            Err(garde::Error::new("may only contain letters, digits, '-' and '_'"))
        }
        _ => Ok(()),
    }
}

/// Request to submit an image-to-video generation job.
#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct GenerateRequest {
    #[garde(length(min = 1, max = 64), custom(job_id_charset))]
    pub job_id: Option<String>,

    #[garde(length(chars, min = 1, max = 2000))]
    pub prompt: String,

    /// Source image: an http(s) URL or a path under the configured image root.
    #[garde(length(min = 1, max = 2000))]
    pub image: String,

    #[garde(skip)]
    pub width: Option<i64>,

    #[garde(skip)]
    pub height: Option<i64>,

    #[garde(skip)]
    pub num_frames: Option<i64>,

    #[garde(skip)]
    pub num_steps: Option<i64>,

    #[garde(skip)]
    pub seed: Option<i64>,

    #[garde(length(min = 1, max = 2000))]
    pub webhook_url: Option<String>,
}

/// Response after submitting a generation job.
#[derive(Debug, Serialize)]
pub struct GenerateResponse {
    pub job_id: String,
    pub status: JobStatus,
    pub message: String,
}

/// Response for querying job status.
#[derive(Debug, Serialize)]
pub struct JobStatusResponse {
    pub job_id: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_time_seconds: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook: Option<WebhookDelivery>,
}

impl From<GenerationJob> for JobStatusResponse {
    fn from(job: GenerationJob) -> Self {
        let webhook = job.webhook.as_ref().map(|_| job.delivery.clone());
        Self {
            job_id: job.id,
            status: job.status,
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
            output_url: job.output.as_ref().map(|o| o.url.clone()),
            generation_time_seconds: job.output.as_ref().map(|o| o.generation_seconds),
            error: job.error,
            webhook,
        }
    }
}

/// Query parameters for listing the caller's jobs.
#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    pub limit: Option<i64>,
    pub status: Option<JobStatus>,
}

/// One row of the job listing.
#[derive(Debug, Serialize)]
pub struct JobSummary {
    pub job_id: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&GenerationJob> for JobSummary {
    fn from(job: &GenerationJob) -> Self {
        Self {
            job_id: job.id.clone(),
            status: job.status,
            created_at: job.created_at,
            completed_at: job.completed_at,
        }
    }
}
