//! Per-user rate limiting, grounded on `rate_limiting/rate_limiter.py`'s
//! `LocalRateLimitCache`: a local in-memory counter checked on every request,
//! synced against the KV store only once a second (or once the local count
//! is already close to the limit), so most requests never touch Redis at
//! all. Kept as a system wholly separate from connection-pool admission
//! control — one governs per-user request rate, the other governs how many
//! concurrent streams the process can run.
//!
//! A sustained per-minute budget (tiered default/premium, `X-Premium-User`
//! grants its own higher-limit bucket rather than just stream priority) is
//! layered with a short burst window so a client can't spend an entire
//! minute's budget in the first second.

use crate::kv::KvClient;
use dashmap::DashMap;
use redis::AsyncCommands;
use std::time::{Duration, Instant};
use tracing::warn;

struct Window {
    count: u32,
    window_start: Instant,
    last_sync: Instant,
    redis_count: u32,
}

/// One counted window (sustained or burst) against a shared KV store.
struct WindowLimiter {
    kv: KvClient,
    key_prefix: &'static str,
    windows: DashMap<String, Window>,
    period: Duration,
    sync_interval: Duration,
}

impl WindowLimiter {
    fn new(kv: KvClient, key_prefix: &'static str, period: Duration) -> Self {
        Self {
            kv,
            key_prefix,
            windows: DashMap::new(),
            period,
            sync_interval: Duration::from_secs(1),
        }
    }

    /// `true` if `key` is still under `limit` for this window; increments on
    /// success. The KV round trip only happens when a sync is due, never on
    /// the hot path of every call.
    async fn check(&self, key: &str, limit: u32) -> bool {
        if limit == 0 {
            return true;
        }
        let now = Instant::now();

        let (local_count, mut synced_count, needs_sync) = {
            let mut entry = self.windows.entry(key.to_string()).or_insert_with(|| Window {
                count: 0,
                window_start: now,
                last_sync: now - self.sync_interval * 2,
                redis_count: 0,
            });
            if now.duration_since(entry.window_start) > self.period {
                entry.count = 0;
                entry.window_start = now;
                entry.redis_count = 0;
            }
            let needs_sync = now.duration_since(entry.last_sync) > self.sync_interval
                || u64::from(entry.count) >= u64::from(limit) * 8 / 10;
            (entry.count, entry.redis_count, needs_sync)
        };

        if needs_sync {
            let redis_key = format!("ratelimit:{}:{key}", self.key_prefix);
            match self.redis_count(&redis_key).await {
                Ok(count) => {
                    synced_count = count;
                    if let Some(mut entry) = self.windows.get_mut(key) {
                        entry.redis_count = count;
                        entry.last_sync = now;
                    }
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "rate limit KV sync failed, falling back to local count");
                }
            }
        }

        if u64::from(local_count) + u64::from(synced_count) >= u64::from(limit) {
            return false;
        }

        if let Some(mut entry) = self.windows.get_mut(key) {
            entry.count += 1;
        }
        self.spawn_increment(format!("ratelimit:{}:{key}", self.key_prefix));
        true
    }

    async fn redis_count(&self, key: &str) -> anyhow::Result<u32> {
        let mut conn = self.kv.connection();
        let count: Option<i64> = conn.get(key).await?;
        Ok(count.unwrap_or(0).max(0) as u32)
    }

    /// Fire-and-forget INCR+EXPIRE, mirroring `_increment_redis_async`'s
    /// decoupling of the sync write from the local admission decision.
    fn spawn_increment(&self, key: String) {
        let mut conn = self.kv.connection();
        let ttl = self.period.as_secs().max(1) as i64;
        tokio::spawn(async move {
            let result: Result<(), redis::RedisError> = redis::pipe()
                .cmd("INCR")
                .arg(&key)
                .ignore()
                .cmd("EXPIRE")
                .arg(&key)
                .arg(ttl)
                .ignore()
                .query_async(&mut conn)
                .await;
            if let Err(e) = result {
                warn!(key = %key, error = %e, "rate limit redis increment failed");
            }
        });
    }
}

/// Tiered per-user rate limiter: a sustained per-minute budget (default vs
/// premium) plus a short burst window, both must allow the request.
pub struct RateLimiter {
    sustained: WindowLimiter,
    burst: WindowLimiter,
    default_limit: u32,
    premium_limit: u32,
    burst_limit: u32,
}

impl RateLimiter {
    #[must_use]
    pub fn new(kv: KvClient, default_limit: u32, premium_limit: u32, burst_limit: u32, window: Duration) -> Self {
        Self {
            sustained: WindowLimiter::new(kv.clone(), "sustained", window),
            burst: WindowLimiter::new(kv, "burst", Duration::from_secs(10)),
            default_limit,
            premium_limit,
            burst_limit,
        }
    }

    /// `true` if the request is allowed; `key` identifies the caller
    /// (`user:<id>` or `premium:<id>` — premium gets its own bucket, not
    /// just priority).
    pub async fn check(&self, key: &str, premium: bool) -> bool {
        let limit = if premium { self.premium_limit } else { self.default_limit };
        self.burst.check(key, self.burst_limit).await && self.sustained.check(key, limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_resets_after_period_elapses() {
        // Exercises the pure-arithmetic reset condition without a live KV
        // connection: the real reset happens inside `check`'s locked block.
        let period = Duration::from_secs(60);
        let window_start = Instant::now() - Duration::from_secs(61);
        assert!(Instant::now().duration_since(window_start) > period);
    }
}
