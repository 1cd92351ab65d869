use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::models::job::{ErrorCategory, GenerationParams, ImageSource};
use crate::services::outbound::{pinned_client, OutboundError};

/// Source images larger than this are rejected.
pub const MAX_IMAGE_BYTES: usize = 20 * 1024 * 1024;

const USER_AGENT: &str = concat!("videogen-gateway/", env!("CARGO_PKG_VERSION"));

/// Output of one generation run.
#[derive(Debug, Clone)]
pub struct GeneratedVideo {
    pub bytes: Vec<u8>,
    pub generation_seconds: f64,
}

/// The external image-to-video model.
#[async_trait]
pub trait VideoGenerator: Send + Sync {
    async fn generate(
        &self,
        params: &GenerationParams,
        image: &[u8],
    ) -> Result<GeneratedVideo, InferenceError>;
}

/// Client for an HTTP inference endpoint.
pub struct InferenceClient {
    http: Client,
    url: String,
    token: Option<String>,
}

#[derive(Serialize)]
struct InferenceRequest<'a> {
    prompt: &'a str,
    image_base64: String,
    seed: u32,
    width: u32,
    height: u32,
    num_frames: u32,
    num_steps: u32,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum InferenceResponse {
    Video {
        video_base64: String,
        generation_time_seconds: f64,
    },
    Failure {
        error: RemoteError,
    },
}

#[derive(Deserialize)]
struct RemoteError {
    category: Option<String>,
    message: String,
}

impl InferenceClient {
    pub fn new(url: String, token: Option<String>) -> Result<Self, InferenceError> {
        let http = Client::builder().user_agent(USER_AGENT).build()?;
        Ok(Self { http, url, token })
    }
}

#[async_trait]
impl VideoGenerator for InferenceClient {
    async fn generate(
        &self,
        params: &GenerationParams,
        image: &[u8],
    ) -> Result<GeneratedVideo, InferenceError> {
        let request_body = InferenceRequest {
            prompt: &params.prompt,
            image_base64: base64::engine::general_purpose::STANDARD.encode(image),
            seed: params.seed,
            width: params.width,
            height: params.height,
            num_frames: params.num_frames,
            num_steps: params.num_steps,
        };

        let mut request = self.http.post(&self.url).json(&request_body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        let body = response.bytes().await?;

        match serde_json::from_slice::<InferenceResponse>(&body) {
            Ok(InferenceResponse::Video {
                video_base64,
                generation_time_seconds,
            }) if status.is_success() => {
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(video_base64.as_bytes())
                    .map_err(|e| InferenceError::Decode(e.to_string()))?;
                if bytes.is_empty() {
                    return Err(InferenceError::Decode("empty video".to_string()));
                }
                Ok(GeneratedVideo {
                    bytes,
                    generation_seconds: generation_time_seconds,
                })
            }
            Ok(InferenceResponse::Failure { error }) => {
                let category = error
                    .category
                    .as_deref()
                    .and_then(|c| c.parse().ok())
                    .unwrap_or(ErrorCategory::InferenceError);
                Err(InferenceError::Remote {
                    category,
                    message: error.message,
                })
            }
            _ if !status.is_success() => Err(InferenceError::Status(status.as_u16())),
            Ok(_) => Err(InferenceError::Decode("unexpected response shape".to_string())),
            Err(e) => Err(InferenceError::Decode(e.to_string())),
        }
    }
}

/// Loads source image bytes for a job.
pub struct ImageFetcher {
    image_root: Option<PathBuf>,
    timeout: Duration,
    max_bytes: usize,
}

impl ImageFetcher {
    pub fn new(image_root: Option<PathBuf>, timeout: Duration) -> Self {
        Self {
            image_root,
            timeout,
            max_bytes: MAX_IMAGE_BYTES,
        }
    }

    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    /// Fetch and sniff the image. Anything that is not JPEG, PNG or WebP is
    /// invalid input.
    pub async fn fetch(&self, source: &ImageSource) -> Result<Vec<u8>, InferenceError> {
        let bytes = match source {
            ImageSource::Remote { url, pinned_addr } => self.fetch_remote(url, pinned_addr).await?,
            ImageSource::Local { path } => self.read_local(path).await?,
        };

        match image::guess_format(&bytes) {
            Ok(image::ImageFormat::Jpeg | image::ImageFormat::Png | image::ImageFormat::WebP) => {
                Ok(bytes)
            }
            Ok(other) => Err(InferenceError::InvalidInput(format!(
                "unsupported image format {other:?}"
            ))),
            Err(_) => Err(InferenceError::InvalidInput(
                "source is not a recognizable image".to_string(),
            )),
        }
    }

    async fn fetch_remote(&self, url: &str, pinned_addr: &str) -> Result<Vec<u8>, InferenceError> {
        let client = pinned_client(url, pinned_addr, self.timeout, USER_AGENT)?;
        let mut response = client
            .get(url)
            .send()
            .await
            .map_err(|e| InferenceError::InvalidInput(format!("image download failed: {e}")))?;

        if !response.status().is_success() {
            return Err(InferenceError::InvalidInput(format!(
                "image download returned {}",
                response.status()
            )));
        }
        if response
            .content_length()
            .is_some_and(|len| len > self.max_bytes as u64)
        {
            return Err(InferenceError::InvalidInput("image is too large".to_string()));
        }

        // Content-Length may be absent; enforce the cap while reading.
        let mut bytes = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| InferenceError::InvalidInput(format!("image download failed: {e}")))?
        {
            if bytes.len() + chunk.len() > self.max_bytes {
                return Err(InferenceError::InvalidInput("image is too large".to_string()));
            }
            bytes.extend_from_slice(&chunk);
        }
        Ok(bytes)
    }

    async fn read_local(&self, path: &str) -> Result<Vec<u8>, InferenceError> {
        let root = self
            .image_root
            .as_ref()
            .ok_or_else(|| InferenceError::InvalidInput("local images are not enabled".to_string()))?;

        // Symlinks may point outside the root even though the path itself does not.
        let root = tokio::fs::canonicalize(root)
            .await
            .map_err(|e| InferenceError::InvalidInput(format!("image root unavailable: {e}")))?;
        let resolved = tokio::fs::canonicalize(path)
            .await
            .map_err(|_| InferenceError::InvalidInput(format!("image '{path}' not found")))?;
        if !resolved.starts_with(&root) {
            return Err(InferenceError::InvalidInput(
                "image path escapes the image root".to_string(),
            ));
        }

        let metadata = tokio::fs::metadata(&resolved)
            .await
            .map_err(|e| InferenceError::InvalidInput(e.to_string()))?;
        if !metadata.is_file() || metadata.len() > self.max_bytes as u64 {
            return Err(InferenceError::InvalidInput(
                "image must be a regular file within the size limit".to_string(),
            ));
        }

        tokio::fs::read(&resolved)
            .await
            .map_err(|e| InferenceError::InvalidInput(e.to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("{message}")]
    Remote {
        category: ErrorCategory,
        message: String,
    },

    #[error("Inference endpoint returned status {0}")]
    Status(u16),

    #[error("Failed to decode inference response: {0}")]
    Decode(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Image source unusable: {0}")]
    Target(#[from] OutboundError),
}

impl InferenceError {
    /// Category recorded on the failed job.
    pub fn category(&self) -> ErrorCategory {
        match self {
            InferenceError::InvalidInput(_) | InferenceError::Target(_) => {
                ErrorCategory::InvalidInput
            }
            InferenceError::Remote { category, .. } => *category,
            InferenceError::Http(e) if e.is_timeout() => ErrorCategory::Timeout,
            InferenceError::Status(_) | InferenceError::Decode(_) | InferenceError::Http(_) => {
                ErrorCategory::InferenceError
            }
        }
    }
}
