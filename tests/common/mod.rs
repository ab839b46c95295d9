//! Common utilities for integration tests: Redis connection helpers and test
//! data generators. Requires a Redis instance reachable at `REDIS_URL`
//! (default `redis://127.0.0.1:6379`), same as the teacher's integration
//! suite.

use anyhow::Result;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use streaming_llm_gateway::cache::ResponseCache;
use streaming_llm_gateway::kv::KvClient;
use streaming_llm_gateway::pool::ConnectionPoolManager;
use streaming_llm_gateway::providers::fake::FakeProvider;
use streaming_llm_gateway::providers::ProviderRegistry;
use streaming_llm_gateway::retry::RetryConfig;
use streaming_llm_gateway::tracker::ExecutionTracker;
use streaming_llm_gateway::{
    LlmProvider, OrchestratorConfig, Priority, RuntimeFlags, StreamOrchestrator, StreamRequest,
};

pub fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
}

/// Generate a unique test key so concurrent test runs don't collide.
pub fn test_key(name: &str) -> String {
    format!("test_{}_{}", name, rand::random::<u32>())
}

pub async fn setup_kv() -> Result<KvClient> {
    KvClient::connect(&redis_url(), 10, Duration::from_millis(10)).await
}

pub async fn setup_cache() -> Result<ResponseCache> {
    ResponseCache::new(&redis_url(), 1000, Duration::from_secs(60)).await
}

/// A fully wired orchestrator backed by the fake provider, a generous pool,
/// and an in-memory log bus — no real upstream LLM or queue infra needed.
pub async fn setup_orchestrator() -> Result<Arc<StreamOrchestrator>> {
    let kv = setup_kv().await?;
    let cache = setup_cache().await?;
    let pool = Arc::new(ConnectionPoolManager::new(kv.clone(), 100, 10, 0.70, 0.90));
    let registry = Arc::new(ProviderRegistry::new(vec![Arc::new(FakeProvider) as Arc<dyn LlmProvider>]));
    let tracker = Arc::new(ExecutionTracker::new(true, 1.0));
    let bus = Arc::new(streaming_llm_gateway::bus::LogBus::new(100));
    let flags = Arc::new(RuntimeFlags {
        use_fake_llm: AtomicBool::new(true),
        enable_caching: AtomicBool::new(true),
    });

    let config = OrchestratorConfig {
        cb_failure_threshold: 5,
        cb_recovery_timeout: Duration::from_secs(30),
        retry: RetryConfig::new(2, 10, 100),
        l2_default_ttl: Duration::from_secs(60),
        heartbeat_interval: Duration::from_secs(30),
        first_chunk_timeout: Duration::from_secs(5),
        total_request_timeout: Duration::from_secs(10),
        queue_failover_timeout: Duration::from_secs(5),
        queue_max_depth: 10_000,
        queue_backpressure_threshold: 0.80,
        queue_backpressure_max_retries: 5,
        queue_backpressure_base_delay: Duration::from_millis(100),
        queue_backpressure_max_delay: Duration::from_millis(5000),
    };

    Ok(Arc::new(StreamOrchestrator::new(
        cache,
        pool,
        registry.clone(),
        registry,
        tracker,
        bus,
        kv,
        flags,
        config,
    )))
}

pub fn sample_request(thread_id: impl Into<String>, query: impl Into<String>) -> StreamRequest {
    StreamRequest {
        query: query.into(),
        model: "gpt-4".to_string(),
        provider: None,
        thread_id: thread_id.into(),
        user_id: "test-user".to_string(),
        priority: Priority::Normal,
        metadata: std::collections::HashMap::new(),
    }
}
