//! Distributed circuit breaker: §4.4.
//!
//! Direct port of the original `DistributedCircuitBreaker` (Redis-backed,
//! CLOSED/OPEN/HALF_OPEN, fail-open on KV outage). HALF_OPEN is not a stored
//! state — like the original, it is derived on read from how long the
//! circuit has been OPEN, and "half-open" just means "allow one probe".

use crate::kv::KvClient;
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "open" => Self::Open,
            "half_open" => Self::HalfOpen,
            _ => Self::Closed,
        }
    }
}

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// One named circuit, e.g. `"provider:openai"`. Cheap to construct per call
/// site — all state lives in the KV store, not in this struct.
pub struct DistributedCircuitBreaker {
    name: String,
    kv: KvClient,
    max_failures: u32,
    reset_timeout: Duration,
    state_key: String,
    failures_key: String,
    last_failure_key: String,
}

impl DistributedCircuitBreaker {
    #[must_use]
    pub fn new(name: impl Into<String>, kv: KvClient, max_failures: u32, reset_timeout: Duration) -> Self {
        let name = name.into();
        let prefix = format!("circuit:{name}");
        Self {
            state_key: format!("{prefix}:state"),
            failures_key: format!("{prefix}:failures"),
            last_failure_key: format!("{prefix}:last_failure_time"),
            name,
            kv,
            max_failures,
            reset_timeout,
        }
    }

    /// Current state, defaulting to CLOSED on a missing key or a KV error.
    pub async fn state(&self) -> CircuitState {
        match self.kv.get(&self.state_key).await {
            Ok(Some(bytes)) => {
                let s = String::from_utf8_lossy(&bytes);
                CircuitState::parse(s.trim())
            }
            Ok(None) => CircuitState::Closed,
            Err(e) => {
                warn!(circuit = %self.name, error = %e, "failed to read circuit state, defaulting to closed");
                CircuitState::Closed
            }
        }
    }

    async fn set_state(&self, state: CircuitState) {
        if let Err(e) = self.kv.set(&self.state_key, state.as_str()).await {
            warn!(circuit = %self.name, error = %e, "failed to set circuit state");
        } else {
            info!(circuit = %self.name, state = state.as_str(), "circuit state changed");
        }
    }

    /// Stage-3 admission check: CLOSED always allows; OPEN allows only once
    /// `reset_timeout` has elapsed since the last recorded failure (the
    /// implicit HALF_OPEN probe); any KV read failure along the way fails open.
    pub async fn should_allow_request(&self) -> bool {
        match self.state().await {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => match self.kv.get(&self.last_failure_key).await {
                Ok(Some(bytes)) => {
                    let parsed: Option<f64> = String::from_utf8_lossy(&bytes).trim().parse().ok();
                    match parsed {
                        Some(last_failure) => {
                            let elapsed = now_secs() - last_failure;
                            if elapsed > self.reset_timeout.as_secs_f64() {
                                info!(circuit = %self.name, "probe allowed, reset timeout elapsed");
                                true
                            } else {
                                false
                            }
                        }
                        None => true,
                    }
                }
                Ok(None) => true,
                Err(e) => {
                    warn!(circuit = %self.name, error = %e, "error checking open timeout, failing open");
                    true
                }
            },
        }
    }

    /// Resets the circuit to CLOSED and zeroes the failure counter.
    pub async fn record_success(&self) {
        let current = self.state().await;
        if current != CircuitState::Closed {
            info!(circuit = %self.name, "circuit recovered, resetting to closed");
            self.set_state(CircuitState::Closed).await;
        }
        if let Err(e) = self.kv.set(&self.failures_key, "0").await {
            warn!(circuit = %self.name, error = %e, "failed to reset failure count");
        }
    }

    /// Increments the failure counter and trips the circuit once
    /// `max_failures` is reached.
    pub async fn record_failure(&self) {
        if let Err(e) = self.kv.set(&self.last_failure_key, &now_secs().to_string()).await {
            warn!(circuit = %self.name, error = %e, "failed to record failure timestamp");
        }

        let failures = match self.kv.incr(&self.failures_key).await {
            Ok(n) => n,
            Err(e) => {
                warn!(circuit = %self.name, error = %e, "failed to increment failure count");
                return;
            }
        };

        warn!(circuit = %self.name, failures, max = self.max_failures, "circuit recorded failure");

        if failures as u32 >= self.max_failures {
            let current = self.state().await;
            if current != CircuitState::Open {
                error!(circuit = %self.name, "circuit tripped, opening");
                self.set_state(CircuitState::Open).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_states() {
        assert_eq!(CircuitState::parse("open"), CircuitState::Open);
        assert_eq!(CircuitState::parse("half_open"), CircuitState::HalfOpen);
        assert_eq!(CircuitState::parse("closed"), CircuitState::Closed);
        assert_eq!(CircuitState::parse("garbage"), CircuitState::Closed);
    }

    #[test]
    fn round_trips_as_str() {
        for s in [CircuitState::Closed, CircuitState::Open, CircuitState::HalfOpen] {
            assert_eq!(CircuitState::parse(s.as_str()), s);
        }
    }
}
