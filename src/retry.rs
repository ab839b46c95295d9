//! Retry-with-backoff resilience wrapper: §4.4 (the `ResilientCall` half).
//!
//! `RetryConfig` and its backoff formula are carried over verbatim from the
//! pack's SSE client retry helper. `call_with_retry` adds the circuit-breaker
//! interlock described in the original `ResilientCall`: check circuit, run
//! with retries, record exactly one success/failure against the circuit for
//! the whole call (not per attempt).

use crate::circuit_breaker::DistributedCircuitBreaker;
use crate::error::GatewayError;
use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl RetryConfig {
    #[must_use]
    pub const fn new(max_retries: u32, initial_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_retries,
            initial_delay_ms,
            max_delay_ms,
        }
    }

    /// `delay = min(initial_ms * 2^attempt, max_ms) + jitter(0..100ms)`
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_delay = self.initial_delay_ms.saturating_mul(1_u64 << attempt.min(20));
        let capped_delay = base_delay.min(self.max_delay_ms);
        let jitter = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| u64::from(d.subsec_millis()))
            % 100;
        Duration::from_millis(capped_delay + jitter)
    }
}

/// Runs `f` under circuit-breaker admission control with retry-with-backoff,
/// recording exactly one success or failure against `circuit` for the whole
/// call. Returns `GatewayError::CircuitOpen` without attempting `f` at all if
/// the circuit is tripped.
pub async fn call_with_retry<T, F, Fut>(
    circuit: &DistributedCircuitBreaker,
    retry: &RetryConfig,
    circuit_name: &str,
    mut f: F,
) -> Result<T, GatewayError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, GatewayError>>,
{
    if !circuit.should_allow_request().await {
        return Err(GatewayError::CircuitOpen(circuit_name.to_string()));
    }

    let mut last_err = None;
    for attempt in 0..=retry.max_retries {
        match f().await {
            Ok(value) => {
                circuit.record_success().await;
                return Ok(value);
            }
            Err(e) if e.is_retryable() && attempt < retry.max_retries => {
                let delay = retry.delay_for_attempt(attempt);
                warn!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "retrying after transient failure");
                tokio::time::sleep(delay).await;
                last_err = Some(e);
            }
            Err(e) => {
                circuit.record_failure().await;
                return Err(e);
            }
        }
    }

    circuit.record_failure().await;
    Err(last_err.unwrap_or(GatewayError::Internal("retry loop exited without a result".into())))
}

#[must_use]
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 502 | 503)
}

#[must_use]
pub fn is_retryable_request_error(error: &reqwest::Error) -> bool {
    error.is_connect() || error.is_timeout()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_exponentially_and_caps() {
        let cfg = RetryConfig::new(10, 500, 5000);
        let d0 = cfg.delay_for_attempt(0).as_millis();
        let d1 = cfg.delay_for_attempt(1).as_millis();
        assert!(d0 >= 500 && d0 < 600);
        assert!(d1 >= 1000 && d1 < 1100);
        let d_large = cfg.delay_for_attempt(10).as_millis();
        assert!(d_large < 5100);
    }

    #[test]
    fn retryable_statuses_match_spec() {
        assert!(is_retryable_status(429));
        assert!(is_retryable_status(502));
        assert!(is_retryable_status(503));
        assert!(!is_retryable_status(500));
        assert!(!is_retryable_status(400));
    }
}
