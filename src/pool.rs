//! Connection pool admission controller: §4.5.
//!
//! Direct port of `ConnectionPoolManager`: distributed counters in the KV
//! store with a local-in-process fallback when the KV store errors, an
//! `tokio::sync::Mutex` guarding the whole acquire (mirroring the original's
//! `asyncio.Lock`), and four health bands derived from the same threshold math.

use crate::error::GatewayError;
use crate::kv::KvClient;
use dashmap::DashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Healthy,
    Degraded,
    Critical,
    Exhausted,
}

struct LocalFallback {
    total: AtomicI64,
    per_user: DashMap<String, i64>,
}

pub struct ConnectionPoolManager {
    kv: KvClient,
    max_connections: u32,
    max_per_user: u32,
    degraded_threshold: u32,
    critical_threshold: u32,
    lock: Mutex<()>,
    local: Arc<LocalFallback>,
    key_total: &'static str,
    key_user_prefix: &'static str,
    key_connections: &'static str,
}

impl ConnectionPoolManager {
    #[must_use]
    pub fn new(kv: KvClient, max_connections: u32, max_per_user: u32, degraded_pct: f64, critical_pct: f64) -> Self {
        let degraded_threshold = (f64::from(max_connections) * degraded_pct) as u32;
        let critical_threshold = (f64::from(max_connections) * critical_pct) as u32;
        info!(
            max_connections,
            max_per_user, degraded_threshold, critical_threshold, "connection pool manager initialized"
        );
        Self {
            kv,
            max_connections,
            max_per_user,
            degraded_threshold,
            critical_threshold,
            lock: Mutex::new(()),
            local: Arc::new(LocalFallback {
                total: AtomicI64::new(0),
                per_user: DashMap::new(),
            }),
            key_total: "connection_pool:total",
            key_user_prefix: "connection_pool:user:",
            key_connections: "connection_pool:connections",
        }
    }

    async fn get_total_count(&self) -> i64 {
        match self.kv.get(self.key_total).await {
            Ok(Some(bytes)) => String::from_utf8_lossy(&bytes).trim().parse().unwrap_or(0),
            _ => self.local.total.load(Ordering::Relaxed),
        }
    }

    async fn get_user_count(&self, user_id: &str) -> i64 {
        let key = format!("{}{}", self.key_user_prefix, user_id);
        match self.kv.get(&key).await {
            Ok(Some(bytes)) => String::from_utf8_lossy(&bytes).trim().parse().unwrap_or(0),
            _ => self.local.per_user.get(user_id).map(|v| *v).unwrap_or(0),
        }
    }

    async fn increment_counts(&self, user_id: &str, thread_id: &str) {
        let user_key = format!("{}{}", self.key_user_prefix, user_id);
        let redis_ok = async {
            self.kv.incr(self.key_total).await?;
            self.kv.incr(&user_key).await?;
            self.kv.sadd(self.key_connections, thread_id).await?;
            anyhow::Ok(())
        }
        .await;

        if let Err(e) = redis_ok {
            warn!(error = %e, "KV increment failed, using local fallback");
            self.local.total.fetch_add(1, Ordering::Relaxed);
            *self.local.per_user.entry(user_id.to_string()).or_insert(0) += 1;
        }
    }

    async fn decrement_counts(&self, user_id: &str, thread_id: &str) {
        let user_key = format!("{}{}", self.key_user_prefix, user_id);
        let redis_ok = async {
            self.kv.decr(self.key_total).await?;
            let remaining = self.kv.decr(&user_key).await?;
            if remaining <= 0 {
                self.kv.del(&user_key).await?;
            }
            self.kv.srem(self.key_connections, thread_id).await?;
            anyhow::Ok(())
        }
        .await;

        if let Err(e) = redis_ok {
            warn!(error = %e, "KV decrement failed, using local fallback");
            let prev = self.local.total.fetch_sub(1, Ordering::Relaxed);
            if prev <= 0 {
                self.local.total.store(0, Ordering::Relaxed);
            }
            if let Some(mut entry) = self.local.per_user.get_mut(user_id) {
                *entry = (*entry - 1).max(0);
            }
        }
    }

    /// Stage 3 admission: total capacity check, then per-user check, then
    /// reserve. Held under one lock for the duration, matching the original's
    /// `asyncio.Lock`-guarded critical section.
    ///
    /// # Errors
    /// `ConnectionPoolExhausted` if the pool is at capacity, `UserConnectionLimit`
    /// if this user already holds `max_per_user` slots.
    pub async fn acquire(&self, user_id: &str, thread_id: &str) -> Result<(), GatewayError> {
        let _guard = self.lock.lock().await;

        let total = self.get_total_count().await;
        let user_count = self.get_user_count(user_id).await;

        if total >= i64::from(self.max_connections) {
            error!(thread_id, total, max = self.max_connections, "connection pool exhausted");
            return Err(GatewayError::ConnectionPoolExhausted);
        }
        if user_count >= i64::from(self.max_per_user) {
            warn!(thread_id, user_id, user_count, max = self.max_per_user, "user connection limit exceeded");
            return Err(GatewayError::UserConnectionLimit);
        }

        self.increment_counts(user_id, thread_id).await;
        let state = self.pool_state().await;
        info!(thread_id, user_id, total = total + 1, ?state, "connection acquired");
        Ok(())
    }

    pub async fn release(&self, user_id: &str, thread_id: &str) {
        let _guard = self.lock.lock().await;
        self.decrement_counts(user_id, thread_id).await;
        let state = self.pool_state().await;
        info!(thread_id, ?state, "connection released");
    }

    pub async fn pool_state(&self) -> ConnectionState {
        let total = self.get_total_count().await;
        if total >= i64::from(self.max_connections) {
            ConnectionState::Exhausted
        } else if total >= i64::from(self.critical_threshold) {
            ConnectionState::Critical
        } else if total >= i64::from(self.degraded_threshold) {
            ConnectionState::Degraded
        } else {
            ConnectionState::Healthy
        }
    }

    pub async fn stats(&self) -> PoolStats {
        let total = self.get_total_count().await;
        let utilization = if self.max_connections > 0 {
            (total as f64 / f64::from(self.max_connections)) * 100.0
        } else {
            0.0
        };
        PoolStats {
            total_connections: total,
            max_connections: self.max_connections,
            utilization_percent: utilization,
            state: self.pool_state().await,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct PoolStats {
    pub total_connections: i64,
    pub max_connections: u32,
    pub utilization_percent: f64,
    pub state: ConnectionState,
}

/// RAII handle released automatically on drop via a spawned task, for use at
/// call sites that cannot conveniently await a release on every exit path.
pub struct ConnectionGuard {
    pool: Arc<ConnectionPoolManager>,
    user_id: String,
    thread_id: String,
    released: bool,
}

impl ConnectionGuard {
    #[must_use]
    pub fn new(pool: Arc<ConnectionPoolManager>, user_id: String, thread_id: String) -> Self {
        Self {
            pool,
            user_id,
            thread_id,
            released: false,
        }
    }

    pub async fn release(mut self) {
        self.pool.release(&self.user_id, &self.thread_id).await;
        self.released = true;
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let pool = Arc::clone(&self.pool);
        let user_id = self.user_id.clone();
        let thread_id = self.thread_id.clone();
        tokio::spawn(async move {
            pool.release(&user_id, &thread_id).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_is_serde_lowercase() {
        let json = serde_json::to_string(&ConnectionState::Degraded).unwrap();
        assert_eq!(json, "\"degraded\"");
    }
}
