//! Two-tier response cache: §4.1.
//!
//! L1 is in-process (`MokaCache`), L2 is distributed (`RedisCache`), both
//! speaking the `Vec<u8>` contract in `traits.rs`. Stampede protection and
//! L2-to-L1 promotion are carried over from `cache_manager.rs`'s
//! `get_or_compute`/`CleanupGuard` pattern, trimmed to the two tiers the
//! gateway actually has — no tier-N generality, no invalidation pub/sub
//! (the gateway never mutates a cached response, it only ever appends one).

use crate::backends::moka_cache::{MokaCache, MokaCacheConfig};
use crate::backends::redis_cache::RedisCache;
use crate::traits::{CacheBackend, L2CacheBackend};
use anyhow::Result;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

type InFlightMap = DashMap<String, Arc<Mutex<()>>>;

struct CleanupGuard<'a> {
    map: &'a InFlightMap,
    key: String,
}

impl Drop for CleanupGuard<'_> {
    fn drop(&mut self) {
        self.map.remove(&self.key);
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CacheMetrics {
    pub l1_hits: u64,
    pub l2_hits: u64,
    pub misses: u64,
    pub sets: u64,
}

struct Inner {
    l1: MokaCache,
    l2: RedisCache,
    kv: crate::kv::KvClient,
    in_flight: InFlightMap,
    l1_hits: AtomicU64,
    l2_hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
}

/// Response cache fronting L1/L2. Cheap to clone — shares one `Inner`.
#[derive(Clone)]
pub struct ResponseCache {
    inner: Arc<Inner>,
}

impl ResponseCache {
    /// # Errors
    /// Returns an error if either backend fails to initialize.
    pub async fn new(redis_url: &str, l1_max_size: u64, l2_default_ttl: Duration) -> Result<Self> {
        let l1 = MokaCache::new(MokaCacheConfig {
            max_capacity: l1_max_size,
            time_to_live: l2_default_ttl,
            time_to_idle: Duration::from_secs(300),
        })?;
        let l2 = RedisCache::with_url(redis_url).await?;
        let kv = crate::kv::KvClient::connect(redis_url, 50, Duration::from_millis(10)).await?;
        Ok(Self {
            inner: Arc::new(Inner {
                l1,
                l2,
                kv,
                in_flight: DashMap::new(),
                l1_hits: AtomicU64::new(0),
                l2_hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                sets: AtomicU64::new(0),
            }),
        })
    }

    /// Read-through get: L1, then L2 with promotion back into L1 carrying the
    /// L2 entry's remaining TTL. A stampede lock is held per key for the
    /// duration of the L2 round trip so concurrent misses on the same key
    /// only hit L2 once.
    pub async fn get(&self, key: &str) -> Option<Vec<u8>> {
        if let Some(value) = self.inner.l1.get(key).await {
            self.inner.l1_hits.fetch_add(1, Ordering::Relaxed);
            return Some(value);
        }

        let lock = self
            .inner
            .in_flight
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;
        let _cleanup = CleanupGuard {
            map: &self.inner.in_flight,
            key: key.to_string(),
        };

        // Another waiter on this lock may have already promoted the value.
        if let Some(value) = self.inner.l1.get(key).await {
            self.inner.l1_hits.fetch_add(1, Ordering::Relaxed);
            return Some(value);
        }

        match self.inner.l2.get_with_ttl(key).await {
            Some((value, ttl)) => {
                self.inner.l2_hits.fetch_add(1, Ordering::Relaxed);
                let promotion_ttl = ttl.unwrap_or(Duration::from_secs(3600));
                if let Err(e) = self.inner.l1.set_with_ttl(key, &value, promotion_ttl).await {
                    warn!(error = %e, key = %key, "L2->L1 promotion failed");
                }
                Some(value)
            }
            None => {
                self.inner.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Write-through set: both tiers, same TTL.
    ///
    /// # Errors
    /// Returns an error only if the L2 write fails; an L1 write failure is
    /// logged and swallowed since the L2 copy remains authoritative.
    pub async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        self.inner.l2.set_with_ttl(key, value, ttl).await?;
        if let Err(e) = self.inner.l1.set_with_ttl(key, value, ttl).await {
            warn!(error = %e, key = %key, "L1 write-through failed, L2 copy still authoritative");
        }
        self.inner.sets.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key, ttl_secs = ttl.as_secs(), "cached response");
        Ok(())
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        let _ = self.inner.l1.remove(key).await;
        self.inner.l2.remove(key).await
    }

    /// Batched lookup: partition into L1 hits/misses, fetch every L1 miss
    /// from L2 in one pipelined MGET, then warm each L2 hit back into L1.
    /// Results are returned in the same order as `keys`.
    pub async fn batch_get(&self, keys: &[String]) -> Vec<Option<Vec<u8>>> {
        let mut results: Vec<Option<Option<Vec<u8>>>> = Vec::with_capacity(keys.len());
        let mut l1_misses: Vec<String> = Vec::new();

        for key in keys {
            if let Some(value) = self.inner.l1.get(key).await {
                self.inner.l1_hits.fetch_add(1, Ordering::Relaxed);
                results.push(Some(Some(value)));
            } else {
                results.push(None);
                l1_misses.push(key.clone());
            }
        }

        if !l1_misses.is_empty() {
            let l2_values = match self.inner.kv.batch_get_many(&l1_misses).await {
                Ok(values) => values,
                Err(e) => {
                    warn!(error = %e, "batched L2 MGET failed, treating the L1-miss set as misses");
                    vec![None; l1_misses.len()]
                }
            };

            for (key, value) in l1_misses.iter().zip(l2_values.into_iter()) {
                match value {
                    Some(bytes) => {
                        self.inner.l2_hits.fetch_add(1, Ordering::Relaxed);
                        if let Err(e) = self.inner.l1.set_with_ttl(key, &bytes, Duration::from_secs(3600)).await {
                            warn!(error = %e, key = %key, "L2->L1 promotion failed during batch_get");
                        }
                        Self::fill(&mut results, keys, key, Some(bytes));
                    }
                    None => {
                        self.inner.misses.fetch_add(1, Ordering::Relaxed);
                        Self::fill(&mut results, keys, key, None);
                    }
                }
            }
        }

        results.into_iter().map(Option::flatten).collect()
    }

    /// Fills in the slot(s) for `key` in `results`, keyed by position in `keys`.
    /// A key appearing more than once in the input batch is filled at every
    /// occurrence.
    fn fill(results: &mut [Option<Option<Vec<u8>>>], keys: &[String], key: &str, value: Option<Vec<u8>>) {
        for (slot, k) in results.iter_mut().zip(keys.iter()) {
            if slot.is_none() && k == key {
                *slot = Some(value.clone());
            }
        }
    }

    pub async fn health_check(&self) -> (bool, bool) {
        (self.inner.l1.health_check().await, self.inner.l2.health_check().await)
    }

    #[must_use]
    pub fn metrics(&self) -> CacheMetrics {
        CacheMetrics {
            l1_hits: self.inner.l1_hits.load(Ordering::Relaxed),
            l2_hits: self.inner.l2_hits.load(Ordering::Relaxed),
            misses: self.inner.misses.load(Ordering::Relaxed),
            sets: self.inner.sets.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_start_at_zero() {
        let m = CacheMetrics::default();
        assert_eq!(m.l1_hits + m.l2_hits + m.misses + m.sets, 0);
    }
}
