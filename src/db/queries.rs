use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::models::job::{
    ErrorCategory, GenerationJob, GenerationParams, ImageSource, JobError, JobOutput, JobStatus,
    JobUpdate, WebhookDelivery, WebhookTarget,
};

const JOB_COLUMNS: &str = "id, credential_id, status, created_at, started_at, completed_at, \
     prompt, image_source, seed, width, height, num_frames, num_steps, \
     output_url, object_key, generation_seconds, error_category, error_message, \
     webhook_url, webhook_addr, webhook_delivered, webhook_attempts, webhook_last_attempt_at";

fn decode_err<E>(e: E) -> sqlx::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    sqlx::Error::Decode(Box::new(e))
}

fn job_from_row(r: &PgRow) -> Result<GenerationJob, sqlx::Error> {
    let status: String = r.try_get("status")?;
    let status: JobStatus = status.parse().map_err(decode_err)?;

    let image: serde_json::Value = r.try_get("image_source")?;
    let image: ImageSource = serde_json::from_value(image).map_err(decode_err)?;

    let seed: i64 = r.try_get("seed")?;
    let width: i32 = r.try_get("width")?;
    let height: i32 = r.try_get("height")?;
    let num_frames: i32 = r.try_get("num_frames")?;
    let num_steps: i32 = r.try_get("num_steps")?;

    let output = match (
        r.try_get::<Option<String>, _>("output_url")?,
        r.try_get::<Option<String>, _>("object_key")?,
    ) {
        (Some(url), Some(object_key)) => Some(JobOutput {
            url,
            object_key,
            generation_seconds: r
                .try_get::<Option<f64>, _>("generation_seconds")?
                .unwrap_or_default(),
        }),
        _ => None,
    };

    let error = match r.try_get::<Option<String>, _>("error_category")? {
        Some(category) => Some(JobError {
            category: category.parse::<ErrorCategory>().map_err(decode_err)?,
            message: r
                .try_get::<Option<String>, _>("error_message")?
                .unwrap_or_default(),
        }),
        None => None,
    };

    let webhook = match (
        r.try_get::<Option<String>, _>("webhook_url")?,
        r.try_get::<Option<String>, _>("webhook_addr")?,
    ) {
        (Some(url), Some(pinned_addr)) => Some(WebhookTarget { url, pinned_addr }),
        _ => None,
    };

    Ok(GenerationJob {
        id: r.try_get("id")?,
        credential_id: r.try_get("credential_id")?,
        status,
        created_at: r.try_get("created_at")?,
        started_at: r.try_get("started_at")?,
        completed_at: r.try_get("completed_at")?,
        params: GenerationParams {
            prompt: r.try_get("prompt")?,
            image,
            seed: u32::try_from(seed).map_err(decode_err)?,
            width: u32::try_from(width).map_err(decode_err)?,
            height: u32::try_from(height).map_err(decode_err)?,
            num_frames: u32::try_from(num_frames).map_err(decode_err)?,
            num_steps: u32::try_from(num_steps).map_err(decode_err)?,
        },
        output,
        error,
        webhook,
        delivery: WebhookDelivery {
            delivered: r.try_get("webhook_delivered")?,
            attempts: r.try_get("webhook_attempts")?,
            last_attempt_at: r.try_get("webhook_last_attempt_at")?,
        },
    })
}

/// Insert a new generation job in `queued`.
pub async fn insert_job(pool: &PgPool, job: &GenerationJob) -> Result<(), sqlx::Error> {
    let image = serde_json::to_value(&job.params.image).map_err(decode_err)?;

    sqlx::query(
        r#"
        INSERT INTO generation_jobs
            (id, credential_id, status, created_at, prompt, image_source, seed,
             width, height, num_frames, num_steps, webhook_url, webhook_addr)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
        "#,
    )
    .bind(&job.id)
    .bind(job.credential_id)
    .bind(job.status.to_string())
    .bind(job.created_at)
    .bind(&job.params.prompt)
    .bind(image)
    .bind(i64::from(job.params.seed))
    .bind(job.params.width as i32)
    .bind(job.params.height as i32)
    .bind(job.params.num_frames as i32)
    .bind(job.params.num_steps as i32)
    .bind(job.webhook.as_ref().map(|w| w.url.as_str()))
    .bind(job.webhook.as_ref().map(|w| w.pinned_addr.as_str()))
    .execute(pool)
    .await?;

    Ok(())
}

/// Get a job by ID
pub async fn get_job(pool: &PgPool, job_id: &str) -> Result<Option<GenerationJob>, sqlx::Error> {
    let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM generation_jobs WHERE id = $1"))
        .bind(job_id)
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(job_from_row).transpose()
}

/// Apply `update` only if the job is currently in `from`.
///
/// Returns the updated job, or `None` when the status did not match (or the
/// job does not exist); the caller re-reads to tell the two apart.
pub async fn compare_and_set(
    pool: &PgPool,
    job_id: &str,
    from: JobStatus,
    update: &JobUpdate,
    at: DateTime<Utc>,
) -> Result<Option<GenerationJob>, sqlx::Error> {
    let (output, error) = match update {
        JobUpdate::Start => (None, None),
        JobUpdate::Complete(out) => (Some(out), None),
        JobUpdate::Fail(err) => (None, Some(err)),
    };

    let row = sqlx::query(&format!(
        r#"
        UPDATE generation_jobs
        SET status = $3::text,
            started_at = CASE WHEN $3::text = 'processing' THEN $4 ELSE started_at END,
            completed_at = CASE WHEN $3::text IN ('completed', 'failed') THEN $4 ELSE completed_at END,
            output_url = COALESCE($5, output_url),
            object_key = COALESCE($6, object_key),
            generation_seconds = COALESCE($7, generation_seconds),
            error_category = COALESCE($8, error_category),
            error_message = COALESCE($9, error_message)
        WHERE id = $1 AND status = $2
        RETURNING {JOB_COLUMNS}
        "#
    ))
    .bind(job_id)
    .bind(from.to_string())
    .bind(update.target().to_string())
    .bind(at)
    .bind(output.map(|o| o.url.as_str()))
    .bind(output.map(|o| o.object_key.as_str()))
    .bind(output.map(|o| o.generation_seconds))
    .bind(error.map(|e| e.category.to_string()))
    .bind(error.map(|e| e.message.as_str()))
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(job_from_row).transpose()
}

/// Record one webhook delivery attempt. Touches delivery columns only.
pub async fn record_webhook_attempt(
    pool: &PgPool,
    job_id: &str,
    attempts: i32,
    delivered: bool,
    at: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE generation_jobs
        SET webhook_attempts = $2,
            webhook_delivered = $3,
            webhook_last_attempt_at = $4
        WHERE id = $1
        "#,
    )
    .bind(job_id)
    .bind(attempts)
    .bind(delivered)
    .bind(at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Recent jobs owned by a credential, newest first.
pub async fn list_jobs_for_credential(
    pool: &PgPool,
    credential_id: Uuid,
    status: Option<JobStatus>,
    limit: i64,
) -> Result<Vec<GenerationJob>, sqlx::Error> {
    let rows = sqlx::query(&format!(
        r#"
        SELECT {JOB_COLUMNS}
        FROM generation_jobs
        WHERE credential_id = $1 AND ($2::text IS NULL OR status = $2)
        ORDER BY created_at DESC
        LIMIT $3
        "#
    ))
    .bind(credential_id)
    .bind(status.map(|s| s.to_string()))
    .bind(limit)
    .fetch_all(pool)
    .await?;

    rows.iter().map(job_from_row).collect()
}

/// Jobs sitting in `status` since before `before` (by start time when set,
/// otherwise creation time), oldest first.
pub async fn list_stale_jobs(
    pool: &PgPool,
    status: JobStatus,
    before: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<GenerationJob>, sqlx::Error> {
    let rows = sqlx::query(&format!(
        r#"
        SELECT {JOB_COLUMNS}
        FROM generation_jobs
        WHERE status = $1 AND COALESCE(started_at, created_at) < $2
        ORDER BY created_at ASC
        LIMIT $3
        "#
    ))
    .bind(status.to_string())
    .bind(before)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    rows.iter().map(job_from_row).collect()
}
