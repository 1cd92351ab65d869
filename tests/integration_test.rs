//! API-level tests over in-memory stores.
//!
//! The PostgreSQL-backed test at the bottom needs a database and is ignored by
//! default. Run with: DATABASE_URL=... cargo test --test integration_test -- --ignored

mod fixtures;
mod helpers;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use serde_json::json;
use std::time::Duration;

use fixtures::*;
use helpers::*;
use videogen_gateway::models::job::{ErrorCategory, JobStatus};
use videogen_gateway::services::job_store::JobStore;

#[tokio::test]
async fn submit_then_complete_then_query() {
    let mut app = TestApp::new().await;
    app.add_key(KEY_A, 10).await;

    let (status, _, body) = app.submit(Some(KEY_A), generate_body()).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "queued");
    let job_id = body["job_id"].as_str().unwrap().to_string();

    let dispatched = app.dispatched.recv().await.unwrap();
    assert_eq!(dispatched, job_id);
    app.runner(false, Duration::from_secs(5))
        .run(&dispatched)
        .await
        .unwrap();

    let (status, body) = app.get(KEY_A, &format!("/api/v1/jobs/{job_id}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "completed");
    assert_eq!(body["generation_time_seconds"], 30.0);
    assert!(body["output_url"].as_str().unwrap().ends_with(&format!("{job_id}.mp4")));
    assert!(body.get("error").is_none());
    assert_eq!(app.artifacts.object_count().await, 1);

    let notified = app.notifier.notified.lock().unwrap().clone();
    assert_eq!(notified.len(), 1);
    assert_eq!(notified[0].status, JobStatus::Completed);
}

#[tokio::test]
async fn generation_timeout_fails_job_and_notifies() {
    let mut app = TestApp::new().await;
    app.add_key(KEY_A, 10).await;

    let (_, _, body) = app
        .submit(Some(KEY_A), with(generate_body(), "job_id", json!("slow-1")))
        .await;
    assert_eq!(body["job_id"], "slow-1");

    let job_id = app.dispatched.recv().await.unwrap();
    app.runner(true, Duration::from_millis(50))
        .run(&job_id)
        .await
        .unwrap();

    let (_, body) = app.get(KEY_A, "/api/v1/jobs/slow-1").await;
    assert_eq!(body["status"], "failed");
    assert_eq!(body["error"]["category"], "timeout");
    assert!(body.get("output_url").is_none());
    assert_eq!(app.notifier.count(), 1);
    assert_eq!(app.artifacts.object_count().await, 0);
}

#[tokio::test]
async fn one_per_minute_limit_rejects_second_submission() {
    let app = TestApp::new().await;
    let credential = app.add_key(KEY_A, 1).await;

    let (first, _, _) = app.submit(Some(KEY_A), generate_body()).await;
    let (second, headers, body) = app.submit(Some(KEY_A), generate_body()).await;

    assert_eq!(first, StatusCode::ACCEPTED);
    assert_eq!(second, StatusCode::TOO_MANY_REQUESTS);
    let retry_after: u64 = headers[header::RETRY_AFTER].to_str().unwrap().parse().unwrap();
    assert!((1..=60).contains(&retry_after));
    assert!(body["error"].as_str().unwrap().contains("Rate limit"));

    let jobs = app.jobs.list_for_credential(credential.id, None, 10).await.unwrap();
    assert_eq!(jobs.len(), 1);
}

#[tokio::test]
async fn revoked_key_is_rejected_without_creating_a_job() {
    let app = TestApp::new().await;
    let credential = app.add_key(KEY_A, 10).await;
    app.credentials.deactivate(credential.id).await;

    let (status, headers, _) = app.submit(Some(KEY_A), generate_body()).await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(headers.contains_key(header::WWW_AUTHENTICATE));
    assert!(app
        .jobs
        .list_for_credential(credential.id, None, 10)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn missing_key_is_unauthorized() {
    let app = TestApp::new().await;
    let (status, _, body) = app.submit(None, generate_body()).await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body["error"].as_str().unwrap().contains("X-API-Key"));
}

#[tokio::test]
async fn unsafe_inputs_are_rejected_with_field() {
    let app = TestApp::new().await;
    app.add_key(KEY_A, 100).await;

    let cases = [
        ("image", json!("http://127.0.0.1/cat.png")),
        ("image", json!("http://169.254.169.254/latest/meta-data")),
        ("image", json!("http://localhost/cat.png")),
        ("image", json!("file:///etc/passwd")),
        ("image", json!("../../etc/passwd")),
        ("webhook_url", json!("http://10.0.0.5/hook")),
        ("width", json!(1001)),
        ("height", json!(128)),
        ("num_frames", json!(120)),
        ("num_steps", json!(0)),
        ("seed", json!(-1)),
        ("prompt", json!("   ")),
    ];

    for (field, value) in cases {
        let (status, _, body) = app
            .submit(Some(KEY_A), with(generate_body(), field, value.clone()))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{field} = {value}");
        assert_eq!(body["field"], field, "{field} = {value}");
    }

    let (status, _, body) = app
        .submit(Some(KEY_A), with(generate_body(), "job_id", json!("has space")))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["field"], "job_id");
}

#[tokio::test]
async fn public_remote_image_is_accepted() {
    let app = TestApp::new().await;
    app.add_key(KEY_A, 10).await;

    let body = with(
        generate_body(),
        "image",
        json!("https://images.example.com/cat.png"),
    );
    let (status, _, _) = app.submit(Some(KEY_A), body).await;
    assert_eq!(status, StatusCode::ACCEPTED);
}

#[tokio::test]
async fn malformed_json_is_bad_request() {
    let app = TestApp::new().await;
    app.add_key(KEY_A, 10).await;

    let request = Request::post("/api/v1/generate")
        .header("content-type", "application/json")
        .header("x-api-key", KEY_A)
        .body(Body::from("{\"prompt\": "))
        .unwrap();
    let (status, _, body) = app.send(request).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["field"], "body");
}

#[tokio::test]
async fn duplicate_job_id_conflicts() {
    let app = TestApp::new().await;
    app.add_key(KEY_A, 10).await;
    let body = with(generate_body(), "job_id", json!("fixed-id"));

    let (first, _, _) = app.submit(Some(KEY_A), body.clone()).await;
    let (second, _, _) = app.submit(Some(KEY_A), body).await;

    assert_eq!(first, StatusCode::ACCEPTED);
    assert_eq!(second, StatusCode::CONFLICT);
}

#[tokio::test]
async fn jobs_are_private_to_their_credential() {
    let app = TestApp::new().await;
    app.add_key(KEY_A, 10).await;
    app.add_key(KEY_B, 10).await;

    app.submit(Some(KEY_A), with(generate_body(), "job_id", json!("a-only")))
        .await;

    let (owner, _) = app.get(KEY_A, "/api/v1/jobs/a-only").await;
    let (other, _) = app.get(KEY_B, "/api/v1/jobs/a-only").await;
    let (missing, _) = app.get(KEY_A, "/api/v1/jobs/nope").await;
    assert_eq!(owner, StatusCode::OK);
    assert_eq!(other, StatusCode::NOT_FOUND);
    assert_eq!(missing, StatusCode::NOT_FOUND);

    let (_, listed_a) = app.get(KEY_A, "/api/v1/jobs").await;
    let (_, listed_b) = app.get(KEY_B, "/api/v1/jobs").await;
    assert_eq!(listed_a.as_array().unwrap().len(), 1);
    assert!(listed_b.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn listing_filters_by_status_and_limits() {
    let app = TestApp::new().await;
    app.add_key(KEY_A, 100).await;

    for i in 0..3 {
        app.submit(Some(KEY_A), with(generate_body(), "job_id", json!(format!("job-{i}"))))
            .await;
    }
    app.orchestrator.on_generation_start("job-1").await.unwrap();
    app.orchestrator
        .on_generation_failure("job-1", ErrorCategory::InferenceError, "bad")
        .await
        .unwrap();

    let (_, failed) = app.get(KEY_A, "/api/v1/jobs?status=failed").await;
    assert_eq!(failed.as_array().unwrap().len(), 1);
    assert_eq!(failed[0]["job_id"], "job-1");

    let (_, limited) = app.get(KEY_A, "/api/v1/jobs?limit=2").await;
    assert_eq!(limited.as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn health_reports_disabled_backends() {
    let app = TestApp::new().await;
    let request = Request::get("/health").body(Body::empty()).unwrap();
    let (status, _, body) = app.send(request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["checks"]["database"]["status"], "disabled");
    assert_eq!(body["checks"]["redis"]["status"], "disabled");
}

#[tokio::test]
#[ignore] // Requires PostgreSQL: DATABASE_URL=... cargo test --test integration_test -- --ignored
async fn postgres_job_store_compare_and_set() {
    use videogen_gateway::db;
    use videogen_gateway::db::credential_queries;
    use videogen_gateway::models::credential::Credential;
    use videogen_gateway::models::job::{
        GenerationJob, GenerationParams, ImageSource, JobError, JobOutput, JobUpdate,
    };
    use videogen_gateway::services::auth::hash_api_key;
    use videogen_gateway::services::job_store::{JobStoreError, PgJobStore};
    use videogen_gateway::services::rate_limit::{PgRateLimitStore, RateDecision, RateLimitStore};

    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let pool = db::init_pool(&url, 5).await.expect("Failed to connect to database");
    db::run_migrations(&pool).await.expect("Failed to run migrations");

    let credential = Credential::new(
        hash_api_key(&format!("it-{}", uuid::Uuid::new_v4())),
        "integration",
        2,
    );
    credential_queries::insert(&pool, &credential).await.unwrap();

    let store = PgJobStore::new(pool.clone());
    let job = GenerationJob::queued(
        format!("it-{}", uuid::Uuid::new_v4()),
        credential.id,
        GenerationParams {
            prompt: "integration".to_string(),
            image: ImageSource::Remote {
                url: "https://images.example.com/cat.png".to_string(),
                pinned_addr: "93.184.216.34".to_string(),
            },
            seed: u32::MAX,
            width: 1280,
            height: 720,
            num_frames: 121,
            num_steps: 8,
        },
        None,
    );
    store.create(&job).await.unwrap();
    assert!(matches!(store.create(&job).await, Err(JobStoreError::Conflict(_))));

    let fetched = store.get(&job.id).await.unwrap();
    assert_eq!(fetched.params, job.params);

    store
        .transition(&job.id, JobStatus::Queued, JobUpdate::Start)
        .await
        .unwrap();
    let complete = JobUpdate::Complete(JobOutput {
        url: "https://cdn.example.com/a.mp4".to_string(),
        object_key: "videos/a.mp4".to_string(),
        generation_seconds: 12.5,
    });
    assert!(store
        .transition(&job.id, JobStatus::Processing, complete.clone())
        .await
        .unwrap()
        .was_applied());
    assert!(!store
        .transition(&job.id, JobStatus::Processing, complete)
        .await
        .unwrap()
        .was_applied());
    let conflicting = JobUpdate::Fail(JobError {
        category: ErrorCategory::Timeout,
        message: "late".to_string(),
    });
    assert!(matches!(
        store.transition(&job.id, JobStatus::Processing, conflicting).await,
        Err(JobStoreError::StaleState { .. })
    ));

    let limiter = PgRateLimitStore::new(pool.clone());
    let now = chrono::Utc::now();
    assert_eq!(limiter.check_and_record(credential.id, 2, now).await.unwrap(), RateDecision::Allowed);
    assert_eq!(limiter.check_and_record(credential.id, 2, now).await.unwrap(), RateDecision::Allowed);
    assert!(matches!(
        limiter.check_and_record(credential.id, 2, now).await.unwrap(),
        RateDecision::Limited { .. }
    ));
}
