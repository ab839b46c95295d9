//! Cache backend implementations.
//!
//! - **Moka** — in-process L1 tier, sub-millisecond latency.
//! - **Redis** — distributed L2 tier, shared across gateway instances.

pub mod moka_cache;
pub mod redis_cache;

pub use moka_cache::MokaCache;
pub use redis_cache::RedisCache;
