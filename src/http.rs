//! HTTP surface: §6. Grounded on `ccheney-reflex`'s axum gateway handler for
//! the SSE response shape (`Content-Type: text/event-stream`, streaming
//! body) and on the teacher's own `axum`/`tower-http` usage pattern for
//! router construction and request tracing.

use crate::cache::ResponseCache;
use crate::model::{Priority, StreamRequest};
use crate::orchestrator::{RuntimeFlags, StreamOrchestrator};
use crate::pool::ConnectionPoolManager;
use crate::rate_limit::RateLimiter;
use crate::tracker::ExecutionTracker;
use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::StreamExt;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

pub struct AppState {
    pub orchestrator: Arc<StreamOrchestrator>,
    pub cache: ResponseCache,
    pub pool: Arc<ConnectionPoolManager>,
    pub tracker: Arc<ExecutionTracker>,
    pub kv: crate::kv::KvClient,
    pub flags: Arc<RuntimeFlags>,
    pub rate_limiter: Arc<RateLimiter>,
    pub started_at: std::time::Instant,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/stream", post(stream_handler))
        .route("/health", get(health))
        .route("/health/detailed", get(health_detailed))
        .route("/health/live", get(health_live))
        .route("/health/ready", get(health_ready))
        .route("/admin/execution-stats", get(execution_stats))
        .route("/admin/circuit-breakers", get(circuit_breakers))
        .route("/admin/metrics", get(metrics))
        .route("/admin/config", get(get_config).post(post_config))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct StreamBody {
    query: String,
    model: String,
    #[serde(default)]
    provider: Option<String>,
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

async fn stream_handler(State(state): State<Arc<AppState>>, headers: HeaderMap, Json(body): Json<StreamBody>) -> Response {
    let thread_id = header_str(&headers, "X-Thread-Id").map(str::to_string).unwrap_or_else(|| Uuid::new_v4().to_string());
    let user_id = header_str(&headers, "X-User-ID").map(str::to_string).unwrap_or_else(|| "anonymous".to_string());
    let premium = header_str(&headers, "X-Premium-User") == Some("true");
    let priority = if premium { Priority::High } else { Priority::Normal };

    let rate_limit_key = if premium { format!("premium:{user_id}") } else { format!("user:{user_id}") };
    if !state.rate_limiter.check(&rate_limit_key, premium).await {
        let err = crate::error::GatewayError::RateLimitExceeded { retry_after_secs: 60 };
        let mut response = (
            StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::TOO_MANY_REQUESTS),
            Json(serde_json::json!({"error": err.code(), "message": err.to_string()})),
        )
            .into_response();
        if let Ok(v) = "60".parse() {
            response.headers_mut().insert("Retry-After", v);
        }
        return response;
    }

    let request = StreamRequest {
        query: body.query,
        model: body.model,
        provider: body.provider,
        thread_id: thread_id.clone(),
        user_id,
        priority,
        metadata: HashMap::new(),
    };

    if let Err(e) = request.validate() {
        return (
            StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::BAD_REQUEST),
            Json(serde_json::json!({"error": e.code(), "message": e.to_string()})),
        )
            .into_response();
    }

    let stream = state.orchestrator.clone().stream(request);
    let body = Body::from_stream(stream.map(|line| Ok::<_, std::convert::Infallible>(line)));

    let mut response = Response::new(body);
    let headers_mut = response.headers_mut();
    headers_mut.insert(header::CONTENT_TYPE, "text/event-stream".parse().unwrap());
    headers_mut.insert(header::CACHE_CONTROL, "no-cache".parse().unwrap());
    headers_mut.insert(header::CONNECTION, "keep-alive".parse().unwrap());
    headers_mut.insert("X-Accel-Buffering", "no".parse().unwrap());
    if let Ok(v) = thread_id.parse() {
        headers_mut.insert("X-Thread-Id", v);
    }
    response
}

fn now_secs() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let (l1, l2) = state.cache.health_check().await;
    let status = if l2 { "healthy" } else { "degraded" };
    Json(serde_json::json!({
        "status": status,
        "timestamp": now_secs(),
        "components": {"cache_l1": l1, "cache_l2": l2},
    }))
}

async fn health_detailed(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let (l1, l2) = state.cache.health_check().await;
    let kv_ok = state.kv.health_check().await;
    let pool_stats = state.pool.stats().await;
    Json(serde_json::json!({
        "status": if l2 && kv_ok { "healthy" } else { "degraded" },
        "timestamp": now_secs(),
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "components": {
            "cache_l1": l1,
            "cache_l2": l2,
            "kv_store": kv_ok,
            "connection_pool": pool_stats,
        },
    }))
}

async fn health_live() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "alive", "timestamp": now_secs()}))
}

async fn health_ready(State(state): State<Arc<AppState>>) -> Response {
    let (_, l2) = state.cache.health_check().await;
    let kv_ok = state.kv.health_check().await;
    if l2 && kv_ok {
        (StatusCode::OK, Json(serde_json::json!({"status": "ready", "timestamp": now_secs()}))).into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(serde_json::json!({"status": "not_ready", "timestamp": now_secs()}))).into_response()
    }
}

#[derive(Deserialize)]
struct ExecutionStatsQuery {
    #[serde(default)]
    thread_id: Option<String>,
    #[serde(default)]
    stage_id: Option<String>,
}

async fn execution_stats(State(state): State<Arc<AppState>>, Query(q): Query<ExecutionStatsQuery>) -> Json<serde_json::Value> {
    if let Some(thread_id) = q.thread_id {
        let summary = state.tracker.get_execution_summary(&thread_id);
        return Json(serde_json::to_value(summary).unwrap_or_default());
    }
    let stage_id = q.stage_id.unwrap_or_else(|| "5".to_string());
    let stats = state.tracker.get_stage_statistics(&stage_id);
    Json(serde_json::to_value(stats).unwrap_or_default())
}

async fn circuit_breakers(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let snapshot = state.orchestrator.circuit_snapshot().await;
    let map: serde_json::Map<String, serde_json::Value> = snapshot
        .into_iter()
        .map(|(name, circuit_state)| (name, serde_json::to_value(circuit_state).unwrap_or_default()))
        .collect();
    Json(serde_json::Value::Object(map))
}

async fn metrics(State(state): State<Arc<AppState>>) -> String {
    let cache_metrics = state.cache.metrics();
    let pool_stats = state.pool.stats().await;
    format!(
        "# HELP gateway_cache_l1_hits_total Total L1 cache hits\n\
         # TYPE gateway_cache_l1_hits_total counter\n\
         gateway_cache_l1_hits_total {}\n\
         # HELP gateway_cache_l2_hits_total Total L2 cache hits\n\
         # TYPE gateway_cache_l2_hits_total counter\n\
         gateway_cache_l2_hits_total {}\n\
         # HELP gateway_cache_misses_total Total cache misses\n\
         # TYPE gateway_cache_misses_total counter\n\
         gateway_cache_misses_total {}\n\
         # HELP gateway_connection_pool_utilization_percent Connection pool utilization\n\
         # TYPE gateway_connection_pool_utilization_percent gauge\n\
         gateway_connection_pool_utilization_percent {}\n",
        cache_metrics.l1_hits, cache_metrics.l2_hits, cache_metrics.misses, pool_stats.utilization_percent,
    )
}

async fn get_config(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "use_fake_llm": state.flags.use_fake_llm.load(Ordering::Relaxed),
        "enable_caching": state.flags.enable_caching.load(Ordering::Relaxed),
        "queue_type": state.orchestrator.bus_backing_name(),
    }))
}

#[derive(Deserialize)]
struct ConfigBody {
    use_fake_llm: Option<bool>,
    enable_caching: Option<bool>,
    queue_type: Option<String>,
}

/// `use_fake_llm`/`enable_caching` take effect on the very next request —
/// both are read live by the orchestrator. `queue_type` selects the bus
/// backing at process startup only (swapping the live consumer/producer
/// without risking in-flight messages is out of scope); a request to change
/// it away from the active backing is rejected with a warning explaining why,
/// rather than silently accepted and ignored.
async fn post_config(State(state): State<Arc<AppState>>, Json(body): Json<ConfigBody>) -> Json<serde_json::Value> {
    if let Some(v) = body.use_fake_llm {
        state.flags.use_fake_llm.store(v, Ordering::Relaxed);
    }
    if let Some(v) = body.enable_caching {
        state.flags.enable_caching.store(v, Ordering::Relaxed);
    }
    let mut warnings: Vec<String> = Vec::new();
    if let Some(v) = body.queue_type {
        if v != state.orchestrator.bus_backing_name() {
            let message = format!(
                "queue_type={v} was not applied: the message bus backing is fixed at startup and cannot be hot-swapped; restart with QUEUE_TYPE={v} instead"
            );
            tracing::warn!(requested = %v, active = %state.orchestrator.bus_backing_name(), "queue_type hot-swap unsupported, request ignored");
            warnings.push(message);
        }
    }

    let mut response = serde_json::json!({
        "use_fake_llm": state.flags.use_fake_llm.load(Ordering::Relaxed),
        "enable_caching": state.flags.enable_caching.load(Ordering::Relaxed),
        "queue_type": state.orchestrator.bus_backing_name(),
    });
    if !warnings.is_empty() {
        response["warnings"] = serde_json::json!(warnings);
    }
    Json(response)
}
