//! Moka Cache - In-Memory Cache Backend
//!
//! High-performance in-memory cache using Moka for hot data storage (L1 tier).

use anyhow::Result;
use moka::future::Cache;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Cache entry with per-key TTL, layered on top of Moka's own eviction policy
#[derive(Debug, Clone)]
struct CacheEntry {
    value: Vec<u8>,
    expires_at: Instant,
}

impl CacheEntry {
    fn new(value: Vec<u8>, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_expired(&self) -> bool {
        Instant::now() > self.expires_at
    }
}

/// Configuration for `MokaCache`
#[derive(Debug, Clone, Copy)]
pub struct MokaCacheConfig {
    /// Max capacity of the cache (entry count)
    pub max_capacity: u64,
    /// Time to live for cache entries (upper bound; per-key TTL can be shorter)
    pub time_to_live: Duration,
    /// Time to idle for cache entries
    pub time_to_idle: Duration,
}

impl Default for MokaCacheConfig {
    fn default() -> Self {
        Self {
            max_capacity: 1000,
            time_to_live: Duration::from_secs(3600),
            time_to_idle: Duration::from_secs(300),
        }
    }
}

/// Moka in-memory cache with per-key TTL support
///
/// This is the L1 (hot tier) cache backend: in-process, bounded by entry count,
/// eviction is capacity/idle driven by Moka itself. Per-key TTL is enforced on
/// top by checking `expires_at` at read time, since the gateway's L1 entries
/// frequently carry a shorter TTL than the backend-wide `time_to_live`.
pub struct MokaCache {
    cache: Cache<String, CacheEntry>,
    hits: Arc<AtomicU64>,
    misses: Arc<AtomicU64>,
    sets: Arc<AtomicU64>,
}

impl MokaCache {
    /// # Errors
    /// Never fails today; returns `Result` to match other backend constructors.
    pub fn new(config: MokaCacheConfig) -> Result<Self> {
        info!("Initializing Moka Cache (L1)");

        let cache = Cache::builder()
            .max_capacity(config.max_capacity)
            .time_to_live(config.time_to_live)
            .time_to_idle(config.time_to_idle)
            .build();

        info!(capacity = config.max_capacity, "Moka Cache initialized");

        Ok(Self {
            cache,
            hits: Arc::new(AtomicU64::new(0)),
            misses: Arc::new(AtomicU64::new(0)),
            sets: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            size: self.cache.entry_count(),
        }
    }
}

use crate::traits::CacheBackend;
use async_trait::async_trait;

#[async_trait]
impl CacheBackend for MokaCache {
    async fn get(&self, key: &str) -> Option<Vec<u8>> {
        if let Some(entry) = self.cache.get(key).await {
            if entry.is_expired() {
                self.cache.invalidate(key).await;
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            } else {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.value)
            }
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    async fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        let entry = CacheEntry::new(value.to_vec(), ttl);
        self.cache.insert(key.to_string(), entry).await;
        self.sets.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key, ttl_secs = %ttl.as_secs(), "[Moka] cached key");
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.cache.invalidate(key).await;
        Ok(())
    }

    async fn health_check(&self) -> bool {
        let test_key = "__health_check_moka__";
        let test_value = b"ok".to_vec();

        if self
            .set_with_ttl(test_key, &test_value, Duration::from_secs(60))
            .await
            .is_err()
        {
            return false;
        }
        match self.get(test_key).await {
            Some(retrieved) => {
                let _ = self.remove(test_key).await;
                retrieved == test_value
            }
            None => false,
        }
    }

    fn name(&self) -> &'static str {
        "Moka"
    }
}

/// Cache statistics
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub size: u64,
}
