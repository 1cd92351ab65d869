use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

/// Status of a generation job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Coarse stage of the generation pipeline a job failed in.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum ErrorCategory {
    InvalidInput,
    InferenceError,
    Timeout,
    StorageFailure,
}

/// Where the source image comes from. Remote references carry the address
/// they resolved to at validation time; fetches connect only to that address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ImageSource {
    Remote { url: String, pinned_addr: String },
    Local { path: String },
}

impl ImageSource {
    /// Reference string persisted in the job record.
    pub fn reference(&self) -> &str {
        match self {
            ImageSource::Remote { url, .. } => url,
            ImageSource::Local { path } => path,
        }
    }
}

/// Generation parameters. Opaque to this crate beyond their bounds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationParams {
    pub prompt: String,
    pub image: ImageSource,
    pub seed: u32,
    pub width: u32,
    pub height: u32,
    pub num_frames: u32,
    pub num_steps: u32,
}

/// Webhook target with the address pinned at validation time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookTarget {
    pub url: String,
    pub pinned_addr: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOutput {
    pub url: String,
    pub object_key: String,
    pub generation_seconds: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub category: ErrorCategory,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WebhookDelivery {
    pub delivered: bool,
    pub attempts: i32,
    pub last_attempt_at: Option<DateTime<Utc>>,
}

/// A video generation job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationJob {
    pub id: String,
    pub credential_id: Uuid,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub params: GenerationParams,
    pub output: Option<JobOutput>,
    pub error: Option<JobError>,
    pub webhook: Option<WebhookTarget>,
    pub delivery: WebhookDelivery,
}

impl GenerationJob {
    /// A freshly accepted job in `queued`.
    pub fn queued(
        id: String,
        credential_id: Uuid,
        params: GenerationParams,
        webhook: Option<WebhookTarget>,
    ) -> Self {
        Self {
            id,
            credential_id,
            status: JobStatus::Queued,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            params,
            output: None,
            error: None,
            webhook,
            delivery: WebhookDelivery::default(),
        }
    }
}

/// A state change requested on a job. The target status is implied.
#[derive(Debug, Clone, PartialEq)]
pub enum JobUpdate {
    Start,
    Complete(JobOutput),
    Fail(JobError),
}

impl JobUpdate {
    pub fn target(&self) -> JobStatus {
        match self {
            JobUpdate::Start => JobStatus::Processing,
            JobUpdate::Complete(_) => JobStatus::Completed,
            JobUpdate::Fail(_) => JobStatus::Failed,
        }
    }

    /// Whether `job` already reflects this update. Completed jobs are compared
    /// on artifact identity; the URL is derived and may differ between signers.
    pub fn already_applied(&self, job: &GenerationJob) -> bool {
        if job.status != self.target() {
            return false;
        }
        match self {
            JobUpdate::Start => true,
            JobUpdate::Complete(out) => job.output.as_ref().is_some_and(|current| {
                current.object_key == out.object_key
                    && current.generation_seconds == out.generation_seconds
            }),
            JobUpdate::Fail(err) => job.error.as_ref() == Some(err),
        }
    }

    /// Apply the update to an in-memory copy of the job.
    pub fn apply(&self, job: &mut GenerationJob, at: DateTime<Utc>) {
        job.status = self.target();
        match self {
            JobUpdate::Start => job.started_at = Some(at),
            JobUpdate::Complete(out) => {
                job.output = Some(out.clone());
                job.completed_at = Some(at);
            }
            JobUpdate::Fail(err) => {
                job.error = Some(err.clone());
                job.completed_at = Some(at);
            }
        }
    }
}
