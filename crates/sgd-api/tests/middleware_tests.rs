// SPDX-License-Identifier: MIT OR Apache-2.0
//! Tests for the ambient middleware stack: request id, rate limiting,
//! response timing, and security headers.

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use sgd_api::{AppState, build_app};
use sgd_budget::{BudgetController, InMemoryBudgetBackend};
use sgd_cache::{Cache, InMemoryBackend, InMemoryLock};
use sgd_config::SgdConfig;
use sgd_ingest::{FixedDimEmbedder, IngestPipeline};
use sgd_provider::{InvokeFn, ProviderClient, ProviderPolicy, RateTable};
use sgd_queue::JobQueue;
use sgd_ratelimit::{EndpointLimits, RateLimiter};
use sgd_render::RenderPipeline;
use sgd_scanner::{NoopScanner, SecurityScanner};
use sgd_storage::LocalFsStorage;
use sgd_vector::InMemoryVectorIndex;
use sgd_workers::WorkerManager;
use std::collections::HashMap;
use std::sync::Arc;
use tower::ServiceExt;

const EMBED_DIMENSION: usize = 16;

fn always_fails_invoke() -> InvokeFn {
    Arc::new(|_model, _task, _payload| Box::pin(async move { Err("not used in these tests".to_string()) }))
}

fn test_state_with_rpm(storage_dir: &std::path::Path, default_rpm: u32) -> Arc<AppState> {
    test_state_with_limits(storage_dir, EndpointLimits { default_rpm, overrides: HashMap::new() })
}

fn test_state_with_limits(storage_dir: &std::path::Path, limits: EndpointLimits) -> Arc<AppState> {
    let config = Arc::new(SgdConfig::default());
    let cache = Arc::new(Cache::new(Arc::new(InMemoryBackend::new()), Arc::new(InMemoryLock::new())));
    let storage = Arc::new(LocalFsStorage::new(storage_dir, "https://cdn.example.test"));
    let budget = Arc::new(BudgetController::new(Box::new(InMemoryBudgetBackend::new()), config.daily_budget_usd));
    let rate_limiter = Arc::new(RateLimiter::new(limits));

    let provider = Arc::new(ProviderClient::new(ProviderPolicy { tasks: HashMap::new() }, RateTable::new(), always_fails_invoke()));
    let render_pipeline = Arc::new(RenderPipeline::new(provider.clone(), cache.clone(), storage.clone(), budget.clone()));
    let queue = Arc::new(JobQueue::new(cache.clone()));
    let workers = Arc::new(WorkerManager::new(queue.clone(), render_pipeline.clone(), 1));
    let ingest = Arc::new(IngestPipeline::new(
        storage.clone(),
        SecurityScanner::new(Box::new(NoopScanner)),
        Arc::new(InMemoryVectorIndex::new()),
        cache.clone(),
        Arc::new(FixedDimEmbedder { dimension: EMBED_DIMENSION }),
        None,
        vec![],
    ));

    Arc::new(AppState {
        config,
        render_pipeline,
        provider,
        queue,
        workers,
        ingest,
        storage,
        scanner: Arc::new(SecurityScanner::new(Box::new(NoopScanner))),
        cache,
        budget,
        rate_limiter,
        started_at: chrono::Utc::now(),
    })
}

async fn healthz(app: Router) -> axum::response::Response {
    app.oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap()).await.unwrap()
}

#[tokio::test]
async fn request_id_header_is_a_valid_uuid() {
    let tmp = tempfile::tempdir().unwrap();
    let app = build_app(test_state_with_rpm(tmp.path(), 100));
    let resp = healthz(app).await;

    let hdr = resp.headers().get("x-request-id").expect("missing x-request-id");
    let parsed: uuid::Uuid = hdr.to_str().unwrap().parse().expect("not a valid uuid");
    assert_ne!(parsed, uuid::Uuid::nil());
}

#[tokio::test]
async fn response_timing_header_present_and_numeric() {
    let tmp = tempfile::tempdir().unwrap();
    let app = build_app(test_state_with_rpm(tmp.path(), 100));
    let resp = healthz(app).await;

    let hdr = resp.headers().get("x-processing-time").expect("missing x-processing-time");
    hdr.to_str().unwrap().parse::<u128>().expect("should be a number of milliseconds");
}

#[tokio::test]
async fn security_headers_present_on_every_response() {
    let tmp = tempfile::tempdir().unwrap();
    let app = build_app(test_state_with_rpm(tmp.path(), 100));
    let resp = healthz(app).await;

    let headers = resp.headers();
    assert_eq!(headers.get("x-content-type-options").unwrap(), "nosniff");
    assert_eq!(headers.get("x-frame-options").unwrap(), "DENY");
    assert!(headers.contains_key("content-security-policy"));
    assert!(headers.contains_key("x-api-version"));
}

#[tokio::test]
async fn rate_limit_headers_present_on_allowed_request() {
    let tmp = tempfile::tempdir().unwrap();
    let app = build_app(test_state_with_rpm(tmp.path(), 100));
    let resp = healthz(app).await;

    assert_eq!(resp.status(), StatusCode::OK);
    assert!(resp.headers().contains_key("x-ratelimit-limit"));
    assert!(resp.headers().contains_key("x-ratelimit-remaining"));
}

#[tokio::test]
async fn rate_limit_blocks_over_limit_with_429_and_retry_after() {
    let tmp = tempfile::tempdir().unwrap();
    let state = test_state_with_rpm(tmp.path(), 1);

    let app = build_app(state.clone());
    let resp = healthz(app).await;
    assert_eq!(resp.status(), StatusCode::OK);

    let app = build_app(state);
    let resp = healthz(app).await;
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(resp.headers().contains_key("retry-after"));
}

/// E2E-7: with the curated per-endpoint limits, `/render` is capped at 30
/// rpm regardless of a much higher default, and the 31st request in the
/// window is rejected with a zero remaining count and a retry-after hint.
#[tokio::test]
async fn render_endpoint_uses_its_curated_rpm_override() {
    let tmp = tempfile::tempdir().unwrap();
    let state = test_state_with_limits(
        tmp.path(),
        EndpointLimits { default_rpm: 1000, ..EndpointLimits::default() },
    );

    let body = serde_json::to_vec(&serde_json::json!({
        "project_id": "p1",
        "prompts": {"task": "create", "instruction": "Create a modern banner for a tech startup", "references": []},
        "outputs": {"count": 1, "format": "png", "width": 512, "height": 512},
    }))
    .unwrap();

    let post = |app: Router| {
        let body = body.clone();
        async move {
            app.oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/render")
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap()
        }
    };

    for _ in 0..30 {
        let resp = post(build_app(state.clone())).await;
        assert_ne!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    let resp = post(build_app(state)).await;
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(resp.headers().get("x-ratelimit-remaining").unwrap(), "0");
    assert!(resp.headers().contains_key("retry-after"));
}

#[tokio::test]
async fn healthz_reports_service_name_and_status_ok() {
    let tmp = tempfile::tempdir().unwrap();
    let app = build_app(test_state_with_rpm(tmp.path(), 100));
    let resp = healthz(app).await;

    let body = resp.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["status"], "ok");
    assert!(json["service"].is_string());
}

#[tokio::test]
async fn metrics_endpoint_returns_text_with_counters() {
    let tmp = tempfile::tempdir().unwrap();
    let app = build_app(test_state_with_rpm(tmp.path(), 100));
    let resp = app.oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap()).await.unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("sgd_active_workers"));
    assert!(text.contains("sgd_dead_letter_jobs"));
}
