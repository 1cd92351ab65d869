use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;

use crate::models::job::{GenerationJob, JobError, JobStatus};
use crate::services::job_store::JobStore;
use crate::services::outbound::{pinned_client, OutboundError};
use crate::services::retry::RetryPolicy;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";
pub const JOB_ID_HEADER: &str = "X-Job-ID";
const USER_AGENT: &str = concat!("videogen-gateway-webhook/", env!("CARGO_PKG_VERSION"));

/// Body POSTed to the caller's webhook.
#[derive(Debug, Serialize)]
pub struct WebhookPayload<'a> {
    pub job_id: &'a str,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_url: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_time_seconds: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<&'a JobError>,
}

impl<'a> WebhookPayload<'a> {
    pub fn for_job(job: &'a GenerationJob) -> Self {
        Self {
            job_id: &job.id,
            status: job.status,
            created_at: job.created_at,
            completed_at: job.completed_at,
            output_url: job.output.as_ref().map(|o| o.url.as_str()),
            generation_time_seconds: job.output.as_ref().map(|o| o.generation_seconds),
            error: job.error.as_ref(),
        }
    }
}

/// `sha256=<hex>` HMAC of `body` under `secret`.
pub fn sign(secret: &str, body: &[u8]) -> String {
    // HMAC accepts keys of any length.
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC key of any size");
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Verify a signature header against the raw body, in constant time.
pub fn verify_signature(secret: &str, body: &[u8], signature_header: &str) -> bool {
    let Some(hex_sig) = signature_header.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_sig) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// Receives jobs that just reached a terminal state.
pub trait Notifier: Send + Sync {
    /// Hand off a notification. Must not block on delivery.
    fn notify(&self, job: GenerationJob);
}

/// Notifier used when webhooks are not configured.
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn notify(&self, job: GenerationJob) {
        tracing::debug!(job_id = %job.id, "Webhooks disabled, skipping notification");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered { attempts: u32 },
    Exhausted { attempts: u32 },
    Skipped,
}

/// Delivers signed webhook notifications with bounded retries.
#[derive(Clone)]
pub struct WebhookDispatcher {
    inner: Arc<Inner>,
}

struct Inner {
    secret: String,
    jobs: Arc<dyn JobStore>,
    policy: RetryPolicy,
    timeout: Duration,
}

impl WebhookDispatcher {
    pub fn new(
        secret: String,
        jobs: Arc<dyn JobStore>,
        policy: RetryPolicy,
        timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                secret,
                jobs,
                policy,
                timeout,
            }),
        }
    }

    /// Deliver the notification for a terminal job, retrying until a 2xx
    /// response or until the attempt budget is spent.
    pub async fn deliver(&self, job: &GenerationJob) -> Result<DeliveryOutcome, WebhookError> {
        let Some(target) = &job.webhook else {
            return Ok(DeliveryOutcome::Skipped);
        };
        if !job.status.is_terminal() {
            tracing::warn!(job_id = %job.id, status = %job.status, "Refusing webhook for non-terminal job");
            return Ok(DeliveryOutcome::Skipped);
        }

        let body = serde_json::to_vec(&WebhookPayload::for_job(job))?;
        let signature = sign(&self.inner.secret, &body);
        let client = pinned_client(&target.url, &target.pinned_addr, self.inner.timeout, USER_AGENT)?;
        let policy = self.inner.policy;

        for attempt in 1..=policy.max_attempts {
            tracing::info!(
                job_id = %job.id,
                attempt,
                max_attempts = policy.max_attempts,
                "Delivering webhook"
            );

            let result = client
                .post(&target.url)
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .header(SIGNATURE_HEADER, &signature)
                .header(JOB_ID_HEADER, &job.id)
                .body(body.clone())
                .send()
                .await;

            let delivered = match &result {
                Ok(response) if response.status().is_success() => true,
                Ok(response) => {
                    tracing::warn!(job_id = %job.id, attempt, status = %response.status(), "Webhook rejected");
                    false
                }
                Err(e) => {
                    tracing::warn!(job_id = %job.id, attempt, error = %e, "Webhook request failed");
                    false
                }
            };

            self.record_attempt(&job.id, attempt, delivered).await;

            if delivered {
                metrics::counter!("webhook_deliveries", "outcome" => "delivered").increment(1);
                tracing::info!(job_id = %job.id, attempt, "Webhook delivered");
                return Ok(DeliveryOutcome::Delivered { attempts: attempt });
            }

            if attempt < policy.max_attempts {
                tokio::time::sleep(policy.backoff(attempt)).await;
            }
        }

        metrics::counter!("webhook_deliveries", "outcome" => "exhausted").increment(1);
        tracing::warn!(
            job_id = %job.id,
            attempts = policy.max_attempts,
            "Webhook delivery exhausted, leaving undelivered"
        );
        Ok(DeliveryOutcome::Exhausted {
            attempts: policy.max_attempts,
        })
    }

    async fn record_attempt(&self, job_id: &str, attempt: u32, delivered: bool) {
        let attempts = i32::try_from(attempt).unwrap_or(i32::MAX);
        if let Err(e) = self
            .inner
            .jobs
            .record_webhook_attempt(job_id, attempts, delivered, Utc::now())
            .await
        {
            tracing::warn!(job_id, attempt, error = %e, "Failed to record webhook attempt");
        }
    }
}

impl Notifier for WebhookDispatcher {
    fn notify(&self, job: GenerationJob) {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            if let Err(e) = dispatcher.deliver(&job).await {
                metrics::counter!("webhook_deliveries", "outcome" => "error").increment(1);
                tracing::error!(job_id = %job.id, error = %e, "Webhook dispatch failed");
            }
        });
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("Webhook target unusable: {0}")]
    Target(#[from] OutboundError),

    #[error("Failed to serialize payload: {0}")]
    Serialize(#[from] serde_json::Error),
}
