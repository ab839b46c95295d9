//! Queue-based failover, third line of defense after cache and retry/circuit
//! breaking: §4.3/§4.7.
//!
//! Grounded on `core/resilience/queue_request_handler.py` (publisher) and
//! `core/resilience/queue_consumer_worker.py` (consumer). The original uses a
//! Redis Pub/Sub channel per request (`queue:results:{request_id}`) so the
//! worker that eventually processes a queued request can be a different
//! instance than the one that accepted the HTTP connection; the publisher
//! subscribes before enqueueing so no chunk can be published before anyone is
//! listening.

use crate::bus::{check_backpressure, MessageBus};
use crate::error::GatewayError;
use crate::model::{QueuedStreamingRequest, StreamRequest};
use anyhow::Result;
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const RESULT_CHANNEL_PREFIX: &str = "queue:results:";
const SIGNAL_DONE: &str = "SIGNAL:DONE";
const SIGNAL_ERROR_PREFIX: &str = "SIGNAL:ERROR:";

fn result_channel(request_id: &str) -> String {
    format!("{RESULT_CHANNEL_PREFIX}{request_id}")
}

/// §4.3 backpressure knobs: checked before every enqueue, with exponential
/// backoff between retries once the queue is over `threshold` of `max_depth`.
#[derive(Debug, Clone, Copy)]
pub struct BackpressureConfig {
    pub max_depth: u64,
    pub threshold: f64,
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

/// Publisher half: enqueue a request and relay the chunks the consumer worker
/// publishes back, until a terminal signal or the overall timeout.
pub struct QueuePublisher {
    kv: crate::kv::KvClient,
    bus: Arc<dyn MessageBus>,
    timeout: Duration,
    backpressure: BackpressureConfig,
}

impl QueuePublisher {
    #[must_use]
    pub fn new(kv: crate::kv::KvClient, bus: Arc<dyn MessageBus>, timeout: Duration, backpressure: BackpressureConfig) -> Self {
        Self { kv, bus, timeout, backpressure }
    }

    /// Check queue depth before enqueueing, retrying with exponential backoff
    /// while the queue stays over `threshold`. Fails with `QueueFull` once
    /// `max_retries` is exhausted.
    async fn wait_for_capacity(&self, request_id: &str) -> Result<(), GatewayError> {
        let cfg = self.backpressure;
        for attempt in 0..=cfg.max_retries {
            match check_backpressure(self.bus.as_ref(), cfg.max_depth, cfg.threshold).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt == cfg.max_retries => {
                    warn!(request_id, attempts = attempt + 1, "queue still over backpressure threshold, giving up");
                    return Err(e);
                }
                Err(_) => {
                    let delay = cfg.base_delay.saturating_mul(1u32 << attempt.min(20)).min(cfg.max_delay);
                    warn!(request_id, attempt, delay_ms = delay.as_millis() as u64, "queue over backpressure threshold, backing off");
                    tokio::time::sleep(delay).await;
                }
            }
        }
        Err(GatewayError::QueueFull)
    }

    /// Subscribe to the per-request result channel, enqueue the request, then
    /// yield each relayed SSE-formatted line until `SIGNAL:DONE`/`SIGNAL:ERROR`
    /// or the timeout elapses.
    pub async fn submit(&self, request_id: &str, request: StreamRequest) -> Result<Vec<String>, GatewayError> {
        self.wait_for_capacity(request_id).await?;

        let channel = result_channel(request_id);
        let mut pubsub = self
            .kv
            .subscribe(&channel)
            .await
            .map_err(|e| GatewayError::QueueConsumer(e.to_string()))?;

        let queued = QueuedStreamingRequest::new(request_id.to_string(), request);
        self.bus
            .produce(&queued)
            .await
            .map_err(|e| GatewayError::QueueConsumer(e.to_string()))?;
        info!(request_id, "queued request for failover processing");

        let mut lines = Vec::new();
        let deadline = tokio::time::Instant::now() + self.timeout;

        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                warn!(request_id, "queue failover timed out waiting for result channel");
                return Err(GatewayError::StreamingTimeout("queue failover timed out".into()));
            }

            let message = tokio::time::timeout(remaining, pubsub.on_message().next()).await;
            let Ok(Some(msg)) = message else {
                warn!(request_id, "queue failover timed out or channel closed");
                return Err(GatewayError::StreamingTimeout("queue failover channel closed".into()));
            };

            let payload: String = match msg.get_payload() {
                Ok(p) => p,
                Err(e) => {
                    warn!(request_id, error = %e, "malformed pubsub payload");
                    continue;
                }
            };

            if payload == SIGNAL_DONE {
                break;
            }
            if let Some(reason) = payload.strip_prefix(SIGNAL_ERROR_PREFIX) {
                return Err(GatewayError::Internal(reason.to_string()));
            }
            lines.push(payload);
        }

        Ok(lines)
    }
}

// The consumer half lives in `orchestrator::run_queue_consumer_once`, since
// processing a queued request means running the same stage 4-6 pipeline the
// local path uses — keeping it there avoids a callback indirection back into
// `orchestrator.rs`.

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_formula_matches_spec() {
        let base: u64 = 100;
        let delay = |retry_count: u32| base.saturating_mul(1 << retry_count.min(20)).min(5000);
        assert_eq!(delay(0), 100);
        assert_eq!(delay(1), 200);
        assert_eq!(delay(2), 400);
        assert_eq!(delay(10), 5000);
    }
}
