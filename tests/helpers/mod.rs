//! Test harness: the full router over in-memory stores.

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tower::ServiceExt;

use videogen_gateway::app_state::AppState;
use videogen_gateway::config::GenerationLimits;
use videogen_gateway::models::credential::Credential;
use videogen_gateway::models::job::{GenerationJob, GenerationParams};
use videogen_gateway::routes;
use videogen_gateway::services::auth::{hash_api_key, Authenticator, InMemoryCredentialStore};
use videogen_gateway::services::inference::{
    GeneratedVideo, ImageFetcher, InferenceError, VideoGenerator,
};
use videogen_gateway::services::job_store::InMemoryJobStore;
use videogen_gateway::services::orchestrator::Orchestrator;
use videogen_gateway::services::queue::LocalDispatch;
use videogen_gateway::services::rate_limit::{InMemoryRateLimitStore, RateLimiter};
use videogen_gateway::services::retry::RetryPolicy;
use videogen_gateway::services::runner::GenerationRunner;
use videogen_gateway::services::storage::InMemoryArtifactStore;
use videogen_gateway::services::validation::{HostResolver, InputValidator};
use videogen_gateway::services::webhook::Notifier;

use crate::fixtures::{PNG_BYTES, PUBLIC_HOSTS};

/// Resolver answering from the fixture host table.
pub struct FixtureResolver(pub HashMap<&'static str, Vec<IpAddr>>);

#[async_trait]
impl HostResolver for FixtureResolver {
    async fn lookup(&self, host: &str, _port: u16) -> std::io::Result<Vec<IpAddr>> {
        self.0.get(host).cloned().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, format!("unknown host {host}"))
        })
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub notified: Mutex<Vec<GenerationJob>>,
}

impl RecordingNotifier {
    pub fn count(&self) -> usize {
        self.notified.lock().unwrap().len()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, job: GenerationJob) {
        self.notified.lock().unwrap().push(job);
    }
}

/// Generator that either returns a fixed clip or never finishes.
pub struct ScriptedGenerator {
    pub hang: bool,
}

#[async_trait]
impl VideoGenerator for ScriptedGenerator {
    async fn generate(
        &self,
        _params: &GenerationParams,
        _image: &[u8],
    ) -> Result<GeneratedVideo, InferenceError> {
        if self.hang {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        Ok(GeneratedVideo {
            bytes: b"\0\0\0\x18ftypmp42".to_vec(),
            generation_seconds: 30.0,
        })
    }
}

pub struct TestApp {
    pub router: Router,
    pub credentials: Arc<InMemoryCredentialStore>,
    pub jobs: Arc<InMemoryJobStore>,
    pub artifacts: Arc<InMemoryArtifactStore>,
    pub notifier: Arc<RecordingNotifier>,
    pub orchestrator: Orchestrator,
    pub dispatched: UnboundedReceiver<String>,
    pub image_root: PathBuf,
}

impl TestApp {
    pub async fn new() -> Self {
        let image_root =
            std::env::temp_dir().join(format!("videogen-it-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&image_root).await.unwrap();
        tokio::fs::write(image_root.join("cat.png"), PNG_BYTES).await.unwrap();

        let credentials = Arc::new(InMemoryCredentialStore::new());
        let jobs = Arc::new(InMemoryJobStore::new());
        let artifacts = Arc::new(InMemoryArtifactStore::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let (dispatch, dispatched) = LocalDispatch::channel();

        let orchestrator = Orchestrator::new(
            jobs.clone(),
            artifacts.clone(),
            Arc::new(dispatch),
            notifier.clone(),
            RetryPolicy::new(2, Duration::from_millis(1)),
        );

        let resolver = FixtureResolver(
            PUBLIC_HOSTS
                .iter()
                .map(|(host, ip)| (*host, vec![ip.parse().unwrap()]))
                .collect(),
        );
        let validator = InputValidator::new(
            GenerationLimits::default(),
            Some(image_root.clone()),
            Arc::new(resolver),
        );

        let state = AppState::new(
            Authenticator::new(credentials.clone()),
            RateLimiter::new(Arc::new(InMemoryRateLimitStore::new())),
            validator,
            orchestrator.clone(),
        );

        Self {
            router: routes::router(state, 64 * 1024),
            credentials,
            jobs,
            artifacts,
            notifier,
            orchestrator,
            dispatched,
            image_root,
        }
    }

    /// Register a credential for `key` and return it.
    pub async fn add_key(&self, key: &str, rate_limit_per_minute: i32) -> Credential {
        let credential = Credential::new(hash_api_key(key), "test", rate_limit_per_minute);
        self.credentials.insert(credential.clone()).await;
        credential
    }

    pub fn runner(&self, hang: bool, timeout: Duration) -> GenerationRunner {
        GenerationRunner::new(
            self.orchestrator.clone(),
            Arc::new(ScriptedGenerator { hang }),
            ImageFetcher::new(Some(self.image_root.clone()), Duration::from_secs(5)),
            timeout,
        )
    }

    pub async fn send(&self, request: Request<Body>) -> (StatusCode, axum::http::HeaderMap, serde_json::Value) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
        };
        (status, headers, body)
    }

    pub async fn submit(
        &self,
        key: Option<&str>,
        body: serde_json::Value,
    ) -> (StatusCode, axum::http::HeaderMap, serde_json::Value) {
        let mut builder = Request::post("/api/v1/generate").header("content-type", "application/json");
        if let Some(key) = key {
            builder = builder.header("x-api-key", key);
        }
        self.send(builder.body(Body::from(body.to_string())).unwrap())
            .await
    }

    pub async fn get(&self, key: &str, uri: &str) -> (StatusCode, serde_json::Value) {
        let request = Request::get(uri)
            .header("x-api-key", key)
            .body(Body::empty())
            .unwrap();
        let (status, _, body) = self.send(request).await;
        (status, body)
    }
}

impl Drop for TestApp {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.image_root);
    }
}
