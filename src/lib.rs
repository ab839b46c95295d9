//! Streaming LLM gateway.
//!
//! A resilient SSE gateway in front of one or more LLM providers: a two-tier
//! response cache (Moka + Redis), a distributed circuit breaker per provider,
//! connection-pool admission control, and a queue-based failover path for
//! requests the pool can't admit immediately. See `orchestrator` for the
//! six-stage request pipeline and `http` for the surface this is served on.

pub mod backends;
pub mod bus;
pub mod cache;
pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod http;
pub mod kv;
pub mod model;
pub mod orchestrator;
pub mod pool;
pub mod providers;
pub mod queue_failover;
pub mod rate_limit;
pub mod retry;
pub mod traits;
pub mod tracker;

pub use cache::ResponseCache;
pub use circuit_breaker::DistributedCircuitBreaker;
pub use config::GatewayConfig;
pub use error::GatewayError;
pub use model::{Priority, SSEEvent, StreamChunk, StreamRequest};
pub use orchestrator::{OrchestratorConfig, RuntimeFlags, StreamOrchestrator};
pub use pool::ConnectionPoolManager;
pub use providers::{LlmProvider, ProviderRegistry};
pub use rate_limit::RateLimiter;
pub use tracker::ExecutionTracker;
pub use traits::{CacheBackend, L2CacheBackend};

// Re-export async_trait for downstream `LlmProvider`/`MessageBus` impls.
pub use async_trait::async_trait;
