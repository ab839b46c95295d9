//! Gateway binary: wires configuration, the KV store, cache, provider
//! registry, and the HTTP surface together, then runs the queue-failover
//! consumer loop alongside the axum server.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use streaming_llm_gateway::bus::{LogBus, MessageBus, RedisStreamBus};
use streaming_llm_gateway::config::{GatewayConfig, QueueBacking};
use streaming_llm_gateway::http::AppState;
use streaming_llm_gateway::kv::KvClient;
use streaming_llm_gateway::orchestrator::{run_queue_consumer_once, OrchestratorConfig, RuntimeFlags, StreamOrchestrator};
use streaming_llm_gateway::pool::ConnectionPoolManager;
use streaming_llm_gateway::providers::fake::FakeProvider;
use streaming_llm_gateway::providers::openai_compat::OpenAiCompatProvider;
use streaming_llm_gateway::providers::{LlmProvider, ProviderRegistry};
use streaming_llm_gateway::rate_limit::RateLimiter;
use streaming_llm_gateway::retry::RetryConfig;
use streaming_llm_gateway::tracker::ExecutionTracker;
use streaming_llm_gateway::ResponseCache;
use tracing_subscriber::EnvFilter;

const QUEUE_TOPIC: &str = "stream_requests";
const QUEUE_CONSUMER_GROUP: &str = "gateway_workers";

/// Providers used when `use_fake_llm` is live-toggled on, independent of
/// whatever real providers are configured.
fn build_fake_providers() -> Vec<Arc<dyn LlmProvider>> {
    vec![Arc::new(FakeProvider)]
}

/// Providers used when `use_fake_llm` is off. Falls back to the fake
/// provider if nothing real is configured, so toggling the flag off never
/// leaves the registry empty.
fn build_real_providers() -> Vec<Arc<dyn LlmProvider>> {
    let mut providers: Vec<Arc<dyn LlmProvider>> = Vec::new();
    if let Ok(base_url) = std::env::var("LLM_PROVIDER_BASE_URL") {
        let api_key = std::env::var("LLM_PROVIDER_API_KEY").unwrap_or_default();
        let models: Vec<String> = std::env::var("LLM_PROVIDER_MODELS")
            .unwrap_or_else(|_| "gpt-4,gpt-3.5-turbo".to_string())
            .split(',')
            .map(str::trim)
            .map(str::to_string)
            .collect();
        providers.push(Arc::new(OpenAiCompatProvider::new(base_url, api_key, models)));
    }
    if providers.is_empty() {
        tracing::warn!("no LLM provider configured, real registry falls back to the fake provider");
        providers.push(Arc::new(FakeProvider));
    }
    providers
}

fn build_bus(config: &GatewayConfig, kv: KvClient) -> Arc<dyn MessageBus> {
    match config.queue_backing {
        QueueBacking::Stream => Arc::new(RedisStreamBus::new(kv, QUEUE_TOPIC, QUEUE_CONSUMER_GROUP, config.queue_max_depth)),
        QueueBacking::Log => Arc::new(LogBus::new(config.queue_max_depth as usize)),
    }
}

async fn run_consumer_loop(orchestrator: Arc<StreamOrchestrator>, bus: Arc<dyn MessageBus>, kv: KvClient, pool: Arc<ConnectionPoolManager>, config: Arc<GatewayConfig>) {
    let consumer_name = format!("consumer-{}", uuid::Uuid::new_v4());
    tracing::info!(consumer_name, "queue-failover consumer loop started");
    loop {
        let result = run_queue_consumer_once(
            orchestrator.as_ref(),
            bus.as_ref(),
            &kv,
            pool.as_ref(),
            &consumer_name,
            config.queue_batch_size,
            config.queue_batch_timeout.as_millis() as u64,
            config.queue_failover_max_retries,
            config.queue_failover_timeout.as_secs_f64(),
            config.queue_failover_base_delay.as_millis() as u64,
        )
        .await;

        match result {
            Ok(0) => tokio::time::sleep(std::time::Duration::from_millis(50)).await,
            Ok(_) => {}
            Err(e) => {
                tracing::error!(error = %e, "queue consumer iteration failed");
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .json()
        .init();

    let config = Arc::new(GatewayConfig::from_env()?);
    tracing::info!(host = %config.api_host, port = config.api_port, "starting streaming LLM gateway");

    let kv = KvClient::connect(&config.redis_url, 50, std::time::Duration::from_millis(10)).await?;

    let cache = ResponseCache::new(&config.redis_url, config.l1_cache_max_size, config.l2_cache_default_ttl).await?;

    let pool = Arc::new(ConnectionPoolManager::new(
        kv.clone(),
        config.max_concurrent_connections,
        config.max_connections_per_user,
        config.pool_degraded_threshold,
        config.pool_critical_threshold,
    ));

    let real_registry = Arc::new(ProviderRegistry::new(build_real_providers()));
    let fake_registry = Arc::new(ProviderRegistry::new(build_fake_providers()));
    let tracker = Arc::new(ExecutionTracker::new(config.execution_tracking_enabled, config.execution_tracking_sample_rate));
    let bus = build_bus(&config, kv.clone());
    let flags = Arc::new(RuntimeFlags {
        use_fake_llm: AtomicBool::new(config.use_fake_llm),
        enable_caching: AtomicBool::new(config.enable_caching),
    });
    let rate_limiter = Arc::new(RateLimiter::new(
        kv.clone(),
        config.rate_limit_default_per_minute,
        config.rate_limit_premium_per_minute,
        config.rate_limit_burst_per_10s,
        Duration::from_secs(60),
    ));

    let orchestrator_config = OrchestratorConfig {
        cb_failure_threshold: config.cb_failure_threshold,
        cb_recovery_timeout: config.cb_recovery_timeout,
        retry: RetryConfig::new(config.max_retries, config.retry_base_delay.as_millis() as u64, config.retry_max_delay.as_millis() as u64),
        l2_default_ttl: config.l2_cache_default_ttl,
        heartbeat_interval: config.heartbeat_interval,
        first_chunk_timeout: config.first_chunk_timeout,
        total_request_timeout: config.total_request_timeout,
        queue_failover_timeout: config.queue_failover_timeout,
        queue_max_depth: config.queue_max_depth,
        queue_backpressure_threshold: config.queue_backpressure_threshold,
        queue_backpressure_max_retries: config.queue_backpressure_max_retries,
        queue_backpressure_base_delay: config.queue_backpressure_base_delay,
        queue_backpressure_max_delay: config.queue_backpressure_max_delay,
    };

    let orchestrator = Arc::new(StreamOrchestrator::new(
        cache.clone(),
        pool.clone(),
        real_registry,
        fake_registry,
        tracker.clone(),
        bus.clone(),
        kv.clone(),
        flags.clone(),
        orchestrator_config,
    ));

    tokio::spawn(run_consumer_loop(orchestrator.clone(), bus, kv.clone(), pool.clone(), config.clone()));

    let state = Arc::new(AppState {
        orchestrator,
        cache,
        pool,
        tracker,
        kv,
        flags,
        rate_limiter,
        started_at: std::time::Instant::now(),
    });

    let app = streaming_llm_gateway::http::router(state);
    let addr = format!("{}:{}", config.api_host, config.api_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(addr, "gateway listening");
    axum::serve(listener, app).await?;

    Ok(())
}
