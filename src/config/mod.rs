use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000"). Ignored by the worker.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// PostgreSQL connection string. Without it jobs, credentials and
    /// rate-limit windows live in process memory.
    pub database_url: Option<String>,

    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,

    /// API key registered at startup when credentials live in memory.
    pub bootstrap_api_key: Option<String>,

    #[serde(default = "default_bootstrap_rate_limit")]
    pub bootstrap_rate_limit_per_minute: i32,

    /// Redis connection string for the generation queue. Without it
    /// generation runs on a background task inside the API process.
    pub redis_url: Option<String>,

    /// Artifact bucket name. Without it artifacts are kept in process memory,
    /// which is only useful for local development.
    pub s3_bucket: Option<String>,

    /// S3-compatible endpoint URL
    #[serde(default)]
    pub s3_endpoint: String,

    #[serde(default = "default_s3_region")]
    pub s3_region: String,

    #[serde(default)]
    pub s3_access_key: String,

    #[serde(default)]
    pub s3_secret_key: String,

    /// Public base URL for artifacts. When unset, presigned GET URLs are issued.
    pub artifact_public_base_url: Option<String>,

    /// Lifetime of presigned artifact URLs.
    #[serde(default = "default_artifact_url_ttl_secs")]
    pub artifact_url_ttl_secs: u32,

    #[serde(default = "default_upload_max_attempts")]
    pub upload_max_attempts: u32,

    #[serde(default = "default_upload_backoff_base_ms")]
    pub upload_backoff_base_ms: u64,

    /// Shared HMAC secret for webhook signatures. Webhooks are disabled when unset.
    pub webhook_secret: Option<String>,

    #[serde(default = "default_webhook_max_attempts")]
    pub webhook_max_attempts: u32,

    #[serde(default = "default_webhook_backoff_base_ms")]
    pub webhook_backoff_base_ms: u64,

    #[serde(default = "default_webhook_timeout_secs")]
    pub webhook_timeout_secs: u64,

    /// Inference endpoint of the external generation service
    pub inference_url: String,

    pub inference_token: Option<String>,

    #[serde(default = "default_generation_timeout_secs")]
    pub generation_timeout_secs: u64,

    /// Directory that local image paths must resolve under.
    pub image_root: Option<String>,

    #[serde(default = "default_image_fetch_timeout_secs")]
    pub image_fetch_timeout_secs: u64,

    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,

    #[serde(default = "default_rate_limit_sweep_secs")]
    pub rate_limit_sweep_secs: u64,

    #[serde(default = "default_stale_job_check_secs")]
    pub stale_job_check_secs: u64,

    /// Queued jobs older than this are handed to the queue again.
    #[serde(default = "default_queued_requeue_secs")]
    pub queued_requeue_secs: i64,

    /// Loaded from the same environment in a second pass.
    #[serde(skip)]
    pub limits: GenerationLimits,
}

/// Defaults and bounds for generation parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct GenerationLimits {
    #[serde(default = "default_width")]
    pub default_width: u32,
    #[serde(default = "default_height")]
    pub default_height: u32,
    #[serde(default = "default_num_frames")]
    pub default_num_frames: u32,
    #[serde(default = "default_num_steps")]
    pub default_num_steps: u32,
    #[serde(default = "default_seed")]
    pub default_seed: u32,
    #[serde(default = "default_max_width")]
    pub max_width: u32,
    #[serde(default = "default_max_height")]
    pub max_height: u32,
    #[serde(default = "default_max_frames")]
    pub max_frames: u32,
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,
}

impl Default for GenerationLimits {
    fn default() -> Self {
        Self {
            default_width: default_width(),
            default_height: default_height(),
            default_num_frames: default_num_frames(),
            default_num_steps: default_num_steps(),
            default_seed: default_seed(),
            max_width: default_max_width(),
            max_height: default_max_height(),
            max_frames: default_max_frames(),
            max_steps: default_max_steps(),
        }
    }
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_db_max_connections() -> u32 {
    10
}

fn default_bootstrap_rate_limit() -> i32 {
    10
}

fn default_s3_region() -> String {
    "auto".to_string()
}

fn default_artifact_url_ttl_secs() -> u32 {
    7 * 24 * 60 * 60
}

fn default_upload_max_attempts() -> u32 {
    3
}

fn default_upload_backoff_base_ms() -> u64 {
    500
}

fn default_webhook_max_attempts() -> u32 {
    5
}

fn default_webhook_backoff_base_ms() -> u64 {
    5000
}

fn default_webhook_timeout_secs() -> u64 {
    30
}

fn default_generation_timeout_secs() -> u64 {
    900
}

fn default_image_fetch_timeout_secs() -> u64 {
    30
}

fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_rate_limit_sweep_secs() -> u64 {
    60
}

fn default_stale_job_check_secs() -> u64 {
    60
}

fn default_queued_requeue_secs() -> i64 {
    300
}

fn default_width() -> u32 {
    1280
}

fn default_height() -> u32 {
    720
}

fn default_num_frames() -> u32 {
    121
}

fn default_num_steps() -> u32 {
    8
}

fn default_seed() -> u32 {
    42
}

fn default_max_width() -> u32 {
    1920
}

fn default_max_height() -> u32 {
    1080
}

fn default_max_frames() -> u32 {
    257
}

fn default_max_steps() -> u32 {
    50
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        let mut config: AppConfig = envy::from_env()?;
        config.limits = envy::from_env()?;
        Ok(config)
    }
}
