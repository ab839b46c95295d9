//! Centralized configuration, loaded from the environment with typed defaults.
//!
//! Grounded on the teacher's own `std::env::var("REDIS_URL").unwrap_or_else(...)`
//! idiom (see `backends/redis_cache.rs`), generalized to every setting named in
//! the external-interfaces configuration list. Defaults are taken from the
//! original service's `src/config/settings.py` / `src/core/resilience/*.py`
//! where the distilled spec leaves a value implicit.

use std::time::Duration;

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueBacking {
    Stream,
    Log,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    // KV store (Redis)
    pub redis_url: String,
    pub redis_min_connections: u32,
    pub redis_max_connections: u32,
    pub redis_health_check_interval: Duration,

    // Cache
    pub l1_cache_max_size: u64,
    pub l2_cache_default_ttl: Duration,

    // Circuit breaker
    pub cb_failure_threshold: u32,
    pub cb_recovery_timeout: Duration,
    pub cb_success_threshold: u32,

    // Retry / resilience wrapper
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,

    // Connection pool admission control
    pub max_concurrent_connections: u32,
    pub max_connections_per_user: u32,
    pub pool_degraded_threshold: f64,
    pub pool_critical_threshold: f64,

    // Message bus / queue
    pub queue_backing: QueueBacking,
    pub queue_max_depth: u64,
    pub queue_backpressure_threshold: f64,
    pub queue_backpressure_max_retries: u32,
    pub queue_backpressure_base_delay: Duration,
    pub queue_backpressure_max_delay: Duration,
    pub queue_batch_size: usize,
    pub queue_batch_timeout: Duration,

    // Queue failover
    pub queue_failover_max_retries: u32,
    pub queue_failover_timeout: Duration,
    pub queue_failover_base_delay: Duration,

    // Timeouts
    pub first_chunk_timeout: Duration,
    pub total_request_timeout: Duration,
    pub heartbeat_interval: Duration,

    // Execution tracking
    pub execution_tracking_enabled: bool,
    pub execution_tracking_sample_rate: f64,

    // Feature flags
    pub use_fake_llm: bool,
    pub enable_caching: bool,

    // Rate limiting, separate from connection-pool admission control
    pub rate_limit_default_per_minute: u32,
    pub rate_limit_premium_per_minute: u32,
    pub rate_limit_burst_per_10s: u32,

    // HTTP
    pub api_host: String,
    pub api_port: u16,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            redis_url: env_string("REDIS_URL", "redis://127.0.0.1:6379"),
            redis_min_connections: env_or("REDIS_MIN_CONNECTIONS", 10),
            redis_max_connections: env_or("REDIS_MAX_CONNECTIONS", 200),
            redis_health_check_interval: Duration::from_secs(env_or(
                "REDIS_HEALTH_CHECK_INTERVAL",
                30,
            )),

            l1_cache_max_size: env_or("CACHE_L1_MAX_SIZE", 1000),
            l2_cache_default_ttl: Duration::from_secs(env_or("CACHE_RESPONSE_TTL", 3600)),

            cb_failure_threshold: env_or("CB_FAILURE_THRESHOLD", 5),
            cb_recovery_timeout: Duration::from_secs(env_or("CB_RECOVERY_TIMEOUT", 60)),
            cb_success_threshold: env_or("CB_SUCCESS_THRESHOLD", 2),

            max_retries: env_or("MAX_RETRIES", 3),
            retry_base_delay: Duration::from_millis(env_or("RETRY_BASE_DELAY_MS", 500)),
            retry_max_delay: Duration::from_millis(env_or("RETRY_MAX_DELAY_MS", 5000)),

            max_concurrent_connections: env_or("MAX_CONCURRENT_CONNECTIONS", 100),
            max_connections_per_user: env_or("MAX_CONNECTIONS_PER_USER", 10),
            pool_degraded_threshold: env_or("CONNECTION_POOL_DEGRADED_THRESHOLD", 0.70),
            pool_critical_threshold: env_or("CONNECTION_POOL_CRITICAL_THRESHOLD", 0.90),

            queue_backing: match env_string("QUEUE_TYPE", "stream").as_str() {
                "log" => QueueBacking::Log,
                _ => QueueBacking::Stream,
            },
            queue_max_depth: env_or("QUEUE_MAX_DEPTH", 10_000),
            queue_backpressure_threshold: env_or("QUEUE_BACKPRESSURE_THRESHOLD", 0.80),
            queue_backpressure_max_retries: env_or("QUEUE_BACKPRESSURE_MAX_RETRIES", 5),
            queue_backpressure_base_delay: Duration::from_millis(env_or(
                "QUEUE_BACKPRESSURE_BASE_DELAY_MS",
                100,
            )),
            queue_backpressure_max_delay: Duration::from_millis(env_or(
                "QUEUE_BACKPRESSURE_MAX_DELAY_MS",
                5000,
            )),
            queue_batch_size: env_or("QUEUE_BATCH_SIZE", 10),
            queue_batch_timeout: Duration::from_millis(env_or("QUEUE_BATCH_TIMEOUT_MS", 10)),

            queue_failover_max_retries: env_or("QUEUE_FAILOVER_MAX_RETRIES", 5),
            queue_failover_timeout: Duration::from_secs(env_or(
                "QUEUE_FAILOVER_TIMEOUT_SECONDS",
                30,
            )),
            queue_failover_base_delay: Duration::from_millis(env_or(
                "QUEUE_FAILOVER_BASE_DELAY_MS",
                100,
            )),

            first_chunk_timeout: Duration::from_secs(env_or("FIRST_CHUNK_TIMEOUT", 10)),
            total_request_timeout: Duration::from_secs(env_or("TOTAL_REQUEST_TIMEOUT", 120)),
            heartbeat_interval: Duration::from_secs(env_or("HEARTBEAT_INTERVAL", 15)),

            execution_tracking_enabled: env_or("EXECUTION_TRACKING_ENABLED", true),
            execution_tracking_sample_rate: env_or("EXECUTION_TRACKING_SAMPLE_RATE", 0.1),

            use_fake_llm: env_or("USE_FAKE_LLM", false),
            enable_caching: env_or("ENABLE_CACHING", true),

            rate_limit_default_per_minute: env_or("RATE_LIMIT_DEFAULT_PER_MINUTE", 60),
            rate_limit_premium_per_minute: env_or("RATE_LIMIT_PREMIUM_PER_MINUTE", 300),
            rate_limit_burst_per_10s: env_or("RATE_LIMIT_BURST_PER_10S", 20),

            api_host: env_string("API_HOST", "0.0.0.0"),
            api_port: env_or("API_PORT", 8000),
        }
    }
}

impl GatewayConfig {
    /// Load from the environment, failing fast if a present value cannot be parsed.
    ///
    /// # Errors
    /// Returns an error naming the offending variable.
    pub fn from_env() -> anyhow::Result<Self> {
        let cfg = Self::default();
        if cfg.max_concurrent_connections == 0 {
            anyhow::bail!("MAX_CONCURRENT_CONNECTIONS must be > 0");
        }
        if !(0.0..=1.0).contains(&cfg.execution_tracking_sample_rate) {
            anyhow::bail!("EXECUTION_TRACKING_SAMPLE_RATE must be in [0.0, 1.0]");
        }
        Ok(cfg)
    }
}
