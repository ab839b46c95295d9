//! Error taxonomy for the streaming gateway.
//!
//! Mirrors the kinds in the original service's exception hierarchy
//! (`src/core/exceptions/*.py`): validation, cache, queue, provider,
//! circuit-breaker, rate-limit, connection-pool, and timeout errors each
//! carry enough structure to become one `error` SSEEvent or one JSON body,
//! never both for the same failure.

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid model: {0}")]
    InvalidModel(String),

    #[error("cache connection error: {0}")]
    CacheConnection(String),

    #[error("cache key error: {0}")]
    CacheKey(String),

    #[error("queue full")]
    QueueFull,

    #[error("queue consumer error: {0}")]
    QueueConsumer(String),

    #[error("provider not available: {0}")]
    ProviderNotAvailable(String),

    #[error("provider authentication failed: {0}")]
    ProviderAuth(String),

    #[error("provider timed out: {0}")]
    ProviderTimeout(String),

    #[error("provider API error: {0}")]
    ProviderApi(String),

    #[error("all providers are down")]
    AllProvidersDown,

    #[error("circuit '{0}' is open")]
    CircuitOpen(String),

    #[error("rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimitExceeded { retry_after_secs: u64 },

    #[error("connection pool exhausted")]
    ConnectionPoolExhausted,

    #[error("user connection limit reached")]
    UserConnectionLimit,

    #[error("streaming timed out: {0}")]
    StreamingTimeout(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Stable machine-readable code, used both on the wire (`error` SSEEvent
    /// `error` field) and in JSON error bodies.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "CONFIG_ERROR",
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::InvalidModel(_) => "INVALID_MODEL",
            Self::CacheConnection(_) => "CACHE_CONNECTION",
            Self::CacheKey(_) => "CACHE_KEY",
            Self::QueueFull => "SERVICE_OVERLOADED",
            Self::QueueConsumer(_) => "QUEUE_CONSUMER",
            Self::ProviderNotAvailable(_) => "PROVIDER_NOT_AVAILABLE",
            Self::ProviderAuth(_) => "PROVIDER_AUTH",
            Self::ProviderTimeout(_) => "PROVIDER_TIMEOUT",
            Self::ProviderApi(_) => "PROVIDER_API",
            Self::AllProvidersDown => "ALL_PROVIDERS_DOWN",
            Self::CircuitOpen(_) => "CIRCUIT_OPEN",
            Self::RateLimitExceeded { .. } => "RATE_LIMIT_EXCEEDED",
            Self::ConnectionPoolExhausted => "CONNECTION_POOL_EXHAUSTED",
            Self::UserConnectionLimit => "USER_CONNECTION_LIMIT",
            Self::StreamingTimeout(_) => "STREAMING_TIMEOUT",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether the resilience wrapper should retry a call that failed this way.
    /// Provider-4xx (auth, bad request) errors are not retried; network-level
    /// and timeout errors are.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ProviderTimeout(_) | Self::ProviderNotAvailable(_))
    }

    /// HTTP status for pre-stream (JSON body) errors.
    #[must_use]
    pub fn http_status(&self) -> u16 {
        match self {
            Self::InvalidInput(_) | Self::InvalidModel(_) => 400,
            Self::RateLimitExceeded { .. } => 429,
            Self::ConnectionPoolExhausted | Self::UserConnectionLimit => 503,
            Self::AllProvidersDown | Self::CircuitOpen(_) => 503,
            Self::Config(_) | Self::Internal(_) => 500,
            _ => 500,
        }
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;
