//! HTTP surface smoke tests against a real Redis instance.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::*;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use streaming_llm_gateway::http::{router, AppState};
use streaming_llm_gateway::{RateLimiter, RuntimeFlags};
use tower::ServiceExt;

async fn build_state() -> Arc<AppState> {
    let orchestrator = setup_orchestrator().await.expect("orchestrator setup");
    let cache = setup_cache().await.expect("cache setup");
    let kv = setup_kv().await.expect("kv setup");
    let pool = Arc::new(streaming_llm_gateway::pool::ConnectionPoolManager::new(kv.clone(), 100, 10, 0.70, 0.90));
    let tracker = Arc::new(streaming_llm_gateway::tracker::ExecutionTracker::new(true, 1.0));
    let rate_limiter = Arc::new(RateLimiter::new(kv.clone(), 10_000, 10_000, 10_000, Duration::from_secs(60)));

    Arc::new(AppState {
        orchestrator,
        cache,
        pool,
        tracker,
        kv,
        flags: Arc::new(RuntimeFlags {
            use_fake_llm: AtomicBool::new(true),
            enable_caching: AtomicBool::new(true),
        }),
        rate_limiter,
        started_at: std::time::Instant::now(),
    })
}

#[tokio::test]
async fn health_endpoint_reports_ok() {
    let app = router(build_state().await);
    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn liveness_endpoint_never_touches_backends() {
    let app = router(build_state().await);
    let response = app
        .oneshot(Request::builder().uri("/health/live").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn stream_endpoint_rejects_an_empty_query() {
    let app = router(build_state().await);
    let body = serde_json::json!({"query": "", "model": "gpt-4"}).to_string();
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/stream")
                .header("content-type", "application/json")
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
