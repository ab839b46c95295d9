//! Message bus abstraction: §4.3.
//!
//! `MessageBus` covers the two queue backings named in configuration
//! (`QueueBacking::Stream` / `QueueBacking::Log`). `RedisStreamBus` is ground
//! on `message_queue/redis_queue.py`'s `RedisQueue` (XADD/XREADGROUP/XACK with
//! a consumer group, MAXLEN trimming). `LogBus` is an in-memory bounded
//! partitioned log standing in for the original's Kafka backing — the pack
//! carries no Kafka client crate, so a process-local log is the closest
//! faithful substitute for the "Log" backing named in configuration; it does
//! not survive a restart, unlike the Python original's Kafka path.

use crate::error::GatewayError;
use crate::model::QueuedStreamingRequest;
use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::AsyncCommands;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// One dequeued unit of work plus its ack handle.
pub struct QueueMessage {
    pub id: String,
    pub payload: QueuedStreamingRequest,
}

#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn produce(&self, payload: &QueuedStreamingRequest) -> Result<String>;
    async fn consume(&self, consumer_name: &str, batch_size: usize, block_ms: u64) -> Result<Vec<QueueMessage>>;
    async fn acknowledge(&self, message_id: &str) -> Result<()>;
    async fn depth(&self) -> Result<u64>;
    /// Short name of the live backing, for the admin config surface.
    fn backing_name(&self) -> &'static str;
}

/// Redis Streams-backed bus: one stream per topic, one consumer group, MAXLEN
/// trimming on produce. Mirrors `RedisQueue.produce`/`.consume`/`.acknowledge`.
pub struct RedisStreamBus {
    kv: crate::kv::KvClient,
    stream_name: String,
    group_name: String,
    max_len: u64,
    group_ready: Mutex<bool>,
}

impl RedisStreamBus {
    #[must_use]
    pub fn new(kv: crate::kv::KvClient, topic: &str, group_name: &str, max_len: u64) -> Self {
        Self {
            kv,
            stream_name: format!("queue:{topic}"),
            group_name: group_name.to_string(),
            max_len,
            group_ready: Mutex::new(false),
        }
    }

    async fn ensure_group(&self) -> Result<()> {
        let mut ready = self.group_ready.lock().await;
        if *ready {
            return Ok(());
        }
        let mut conn = self.kv.connection();
        let result: redis::RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream_name)
            .arg(&self.group_name)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;
        if let Err(e) = result {
            if !e.to_string().contains("BUSYGROUP") {
                return Err(e).context("failed to create consumer group");
            }
        }
        *ready = true;
        Ok(())
    }
}

#[async_trait]
impl MessageBus for RedisStreamBus {
    async fn produce(&self, payload: &QueuedStreamingRequest) -> Result<String> {
        self.ensure_group().await?;
        let mut conn = self.kv.connection();
        let body = serde_json::to_string(payload).context("failed to serialize queued request")?;
        let id: String = redis::cmd("XADD")
            .arg(&self.stream_name)
            .arg("MAXLEN")
            .arg("~")
            .arg(self.max_len)
            .arg("*")
            .arg("payload")
            .arg(body)
            .query_async(&mut conn)
            .await
            .context("XADD failed")?;
        debug!(stream = %self.stream_name, id = %id, "produced message");
        Ok(id)
    }

    async fn consume(&self, consumer_name: &str, batch_size: usize, block_ms: u64) -> Result<Vec<QueueMessage>> {
        self.ensure_group().await?;
        let mut conn = self.kv.connection();

        type StreamReply = Vec<(String, Vec<(String, Vec<(String, String)>)>)>;
        let reply: StreamReply = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.group_name)
            .arg(consumer_name)
            .arg("COUNT")
            .arg(batch_size)
            .arg("BLOCK")
            .arg(block_ms)
            .arg("STREAMS")
            .arg(&self.stream_name)
            .arg(">")
            .query_async(&mut conn)
            .await
            .context("XREADGROUP failed")?;

        let mut out = Vec::new();
        for (_stream, entries) in reply {
            for (id, fields) in entries {
                let body = fields.into_iter().find(|(k, _)| k == "payload").map(|(_, v)| v);
                let Some(body) = body else { continue };
                match serde_json::from_str::<QueuedStreamingRequest>(&body) {
                    Ok(payload) => out.push(QueueMessage { id, payload }),
                    Err(e) => warn!(id = %id, error = %e, "dropping malformed queue message"),
                }
            }
        }
        Ok(out)
    }

    async fn acknowledge(&self, message_id: &str) -> Result<()> {
        let mut conn = self.kv.connection();
        let _: i64 = conn
            .xack(&self.stream_name, &self.group_name, &[message_id])
            .await
            .context("XACK failed")?;
        Ok(())
    }

    async fn depth(&self) -> Result<u64> {
        let mut conn = self.kv.connection();
        let len: u64 = redis::cmd("XLEN")
            .arg(&self.stream_name)
            .query_async(&mut conn)
            .await
            .unwrap_or(0);
        Ok(len)
    }

    fn backing_name(&self) -> &'static str {
        "stream"
    }
}

/// In-memory bounded log, standing in for a Kafka "Log" backing in a single
/// process. Messages are acknowledged by removal from a pending map; an
/// unacknowledged message simply stays invisible to future `consume` calls
/// until the process restarts (no redelivery, unlike the stream backing).
pub struct LogBus {
    queue: Mutex<VecDeque<(u64, QueuedStreamingRequest)>>,
    pending: Mutex<std::collections::HashMap<String, QueuedStreamingRequest>>,
    next_id: std::sync::atomic::AtomicU64,
    max_len: usize,
}

impl LogBus {
    #[must_use]
    pub fn new(max_len: usize) -> Self {
        info!(max_len, "initialized in-memory log bus");
        Self {
            queue: Mutex::new(VecDeque::new()),
            pending: Mutex::new(std::collections::HashMap::new()),
            next_id: std::sync::atomic::AtomicU64::new(0),
            max_len,
        }
    }
}

#[async_trait]
impl MessageBus for LogBus {
    async fn produce(&self, payload: &QueuedStreamingRequest) -> Result<String> {
        let id = self.next_id.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let mut queue = self.queue.lock().await;
        if queue.len() >= self.max_len {
            queue.pop_front();
        }
        queue.push_back((id, payload.clone()));
        Ok(id.to_string())
    }

    async fn consume(&self, _consumer_name: &str, batch_size: usize, _block_ms: u64) -> Result<Vec<QueueMessage>> {
        let mut queue = self.queue.lock().await;
        let mut pending = self.pending.lock().await;
        let mut out = Vec::new();
        for _ in 0..batch_size {
            let Some((id, payload)) = queue.pop_front() else { break };
            let id = id.to_string();
            pending.insert(id.clone(), payload.clone());
            out.push(QueueMessage { id, payload });
        }
        Ok(out)
    }

    async fn acknowledge(&self, message_id: &str) -> Result<()> {
        self.pending.lock().await.remove(message_id);
        Ok(())
    }

    async fn depth(&self) -> Result<u64> {
        Ok(self.queue.lock().await.len() as u64)
    }

    fn backing_name(&self) -> &'static str {
        "log"
    }
}

/// §4.3 backpressure gate. Call before `produce`; `GatewayError::QueueFull`
/// maps to the `SERVICE_OVERLOADED` wire code.
pub async fn check_backpressure(bus: &dyn MessageBus, max_depth: u64, threshold: f64) -> Result<(), GatewayError> {
    let depth = bus
        .depth()
        .await
        .map_err(|e| GatewayError::QueueConsumer(e.to_string()))?;
    let limit = (max_depth as f64 * threshold) as u64;
    if depth >= limit {
        warn!(depth, limit, max_depth, "queue depth over backpressure threshold");
        return Err(GatewayError::QueueFull);
    }
    Ok(())
}

pub type SharedBus = Arc<dyn MessageBus>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Priority, StreamRequest};
    use std::collections::HashMap;

    fn sample_request() -> QueuedStreamingRequest {
        QueuedStreamingRequest::new(
            "req-1".into(),
            StreamRequest {
                query: "hi".into(),
                model: "gpt-4".into(),
                provider: None,
                thread_id: "t1".into(),
                user_id: "u1".into(),
                priority: Priority::Normal,
                metadata: HashMap::new(),
            },
        )
    }

    #[tokio::test]
    async fn log_bus_round_trips_and_acks() {
        let bus = LogBus::new(10);
        bus.produce(&sample_request()).await.unwrap();
        assert_eq!(bus.depth().await.unwrap(), 1);

        let msgs = bus.consume("c1", 10, 0).await.unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(bus.depth().await.unwrap(), 0);

        bus.acknowledge(&msgs[0].id).await.unwrap();
        assert!(bus.pending.lock().await.is_empty());
    }

    #[tokio::test]
    async fn log_bus_bounded_drops_oldest() {
        let bus = LogBus::new(2);
        for i in 0..3 {
            let mut req = sample_request();
            req.request_id = format!("req-{i}");
            bus.produce(&req).await.unwrap();
        }
        assert_eq!(bus.depth().await.unwrap(), 2);
    }
}
