//! KV store client: §4.2.
//!
//! A `redis::aio::ConnectionManager`-backed client (same connection strategy
//! as `backends/redis_cache.rs`) fronting every piece of distributed state in
//! the gateway — cache L2, circuit-breaker records, connection-pool counters,
//! the message bus, and queue-failover pub/sub. Adds an auto-batching path on
//! top of the direct path: commands queued via `batch_get`/`batch_incr` are
//! flushed together once `BATCH_SIZE` commands are queued or `BATCH_TIMEOUT`
//! elapses, whichever comes first.

use anyhow::{Context, Result};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};

/// One pending batched GET, waiting for the next flush. `reply` carries a
/// `Result` so a failed MGET can be told apart from a genuine cache miss —
/// every waiter in the batch gets the same error, not a silent `None`.
struct PendingGet {
    key: String,
    reply: oneshot::Sender<Result<Option<Vec<u8>>, String>>,
}

struct BatcherState {
    pending: Vec<PendingGet>,
}

/// Pooled async client to the shared KV store (Redis). Cheap to clone — all
/// clones share the same `ConnectionManager` and batcher state.
#[derive(Clone)]
pub struct KvClient {
    conn: ConnectionManager,
    client: Client,
    batch_size: usize,
    batch_timeout: Duration,
    batcher: Arc<Mutex<BatcherState>>,
    flushing: Arc<std::sync::atomic::AtomicBool>,
    ops: Arc<AtomicU64>,
}

impl KvClient {
    /// # Errors
    /// Returns an error if the client cannot be built or the initial `PING` fails.
    pub async fn connect(redis_url: &str, batch_size: usize, batch_timeout: Duration) -> Result<Self> {
        info!(redis_url = %redis_url, "connecting KV client");
        let client =
            Client::open(redis_url).with_context(|| format!("invalid redis url: {redis_url}"))?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .context("failed to establish KV connection manager")?;

        let mut probe = conn.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut probe)
            .await
            .context("KV store PING failed")?;

        Ok(Self {
            conn,
            client,
            batch_size,
            batch_timeout,
            batcher: Arc::new(Mutex::new(BatcherState { pending: Vec::new() })),
            flushing: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            ops: Arc::new(AtomicU64::new(0)),
        })
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }

    /// Raw connection handle for commands this client doesn't wrap directly
    /// (stream consumer-group operations in `bus.rs`).
    #[must_use]
    pub fn connection(&self) -> ConnectionManager {
        self.conn.clone()
    }

    /// Direct-path GET, bypassing the batcher.
    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.ops.fetch_add(1, Ordering::Relaxed);
        let mut conn = self.conn();
        let value: Option<Vec<u8>> = conn.get(key).await.context("KV GET failed")?;
        Ok(value.filter(|v| !v.is_empty()))
    }

    pub async fn set_ex(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        self.ops.fetch_add(1, Ordering::Relaxed);
        let mut conn = self.conn();
        let secs = ttl.as_secs().max(1);
        let _: () = conn.set_ex(key, value, secs).await.context("KV SETEX failed")?;
        Ok(())
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.ops.fetch_add(1, Ordering::Relaxed);
        let mut conn = self.conn();
        let _: () = conn.set(key, value).await.context("KV SET failed")?;
        Ok(())
    }

    pub async fn del(&self, key: &str) -> Result<()> {
        self.ops.fetch_add(1, Ordering::Relaxed);
        let mut conn = self.conn();
        let _: () = conn.del(key).await.context("KV DEL failed")?;
        Ok(())
    }

    pub async fn incr(&self, key: &str) -> Result<i64> {
        self.ops.fetch_add(1, Ordering::Relaxed);
        let mut conn = self.conn();
        conn.incr(key, 1).await.context("KV INCR failed")
    }

    pub async fn decr(&self, key: &str) -> Result<i64> {
        self.ops.fetch_add(1, Ordering::Relaxed);
        let mut conn = self.conn();
        conn.decr(key, 1).await.context("KV DECR failed")
    }

    pub async fn sadd(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.conn();
        let _: () = conn.sadd(key, member).await.context("KV SADD failed")?;
        Ok(())
    }

    pub async fn srem(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.conn();
        let _: () = conn.srem(key, member).await.context("KV SREM failed")?;
        Ok(())
    }

    pub async fn ttl(&self, key: &str) -> Result<i64> {
        let mut conn = self.conn();
        redis::cmd("TTL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .context("KV TTL failed")
    }

    /// Queue a GET through the auto-batcher. Flushes happen when the queue
    /// reaches `batch_size` or `batch_timeout` elapses — only one flush is
    /// in flight at a time; enqueues during a flush land in the next batch.
    pub async fn batch_get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let (tx, rx) = oneshot::channel();
        let should_spawn_timer = {
            let mut state = self.batcher.lock().await;
            state.pending.push(PendingGet {
                key: key.to_string(),
                reply: tx,
            });
            let at_threshold = state.pending.len() >= self.batch_size;
            if at_threshold {
                drop(state);
                self.flush_batch().await;
                false
            } else {
                state.pending.len() == 1
            }
        };

        if should_spawn_timer {
            let this = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(this.batch_timeout).await;
                this.flush_batch().await;
            });
        }

        match rx.await.context("batch GET waiter dropped before reply")? {
            Ok(value) => Ok(value),
            Err(e) => Err(anyhow::anyhow!("batched KV flush failed: {e}")),
        }
    }

    /// Pipelined MGET for a known set of keys, used by the cache's L2-miss
    /// batch lookup (§4.1/§4.2) instead of the per-key auto-batcher, since the
    /// caller already knows the full key set up front and wants one round trip.
    pub async fn batch_get_many(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        self.ops.fetch_add(1, Ordering::Relaxed);
        let mut conn = self.conn();
        let values: Vec<Option<Vec<u8>>> = conn.mget(keys).await.context("KV MGET failed")?;
        Ok(values.into_iter().map(|v| v.filter(|b| !b.is_empty())).collect())
    }

    async fn flush_batch(&self) {
        if self
            .flushing
            .compare_exchange(
                false,
                true,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return;
        }

        let waiters = {
            let mut state = self.batcher.lock().await;
            std::mem::take(&mut state.pending)
        };

        if waiters.is_empty() {
            self.flushing.store(false, Ordering::Release);
            return;
        }

        let mut conn = self.conn();
        let keys: Vec<&str> = waiters.iter().map(|w| w.key.as_str()).collect();
        let result: Result<Vec<Option<Vec<u8>>>, redis::RedisError> = conn.mget(&keys).await;

        match result {
            Ok(values) => {
                for (waiter, value) in waiters.into_iter().zip(values.into_iter()) {
                    let _ = waiter.reply.send(Ok(value.filter(|v| !v.is_empty())));
                }
            }
            Err(e) => {
                warn!(error = %e, "batched KV flush failed, propagating error to all waiters");
                let message = e.to_string();
                for waiter in waiters {
                    let _ = waiter.reply.send(Err(message.clone()));
                }
            }
        }

        self.flushing.store(false, Ordering::Release);
    }

    pub async fn publish(&self, channel: &str, message: &str) -> Result<()> {
        let mut conn = self.conn();
        let _: () = conn.publish(channel, message).await.context("KV PUBLISH failed")?;
        Ok(())
    }

    /// Open a dedicated pub/sub connection and subscribe to `channel` before
    /// returning, matching the queue-failover invariant that a subscription
    /// must exist before the corresponding enqueue.
    pub async fn subscribe(&self, channel: &str) -> Result<redis::aio::PubSub> {
        let mut pubsub = self.client.get_async_pubsub().await.context("pubsub connect failed")?;
        pubsub.subscribe(channel).await.context("pubsub subscribe failed")?;
        debug!(channel = %channel, "subscribed");
        Ok(pubsub)
    }

    pub async fn health_check(&self) -> bool {
        let mut conn = self.conn();
        redis::cmd("PING").query_async::<String>(&mut conn).await.is_ok()
    }

    pub fn operation_count(&self) -> u64 {
        self.ops.load(Ordering::Relaxed)
    }
}
