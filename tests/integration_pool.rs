//! Connection-pool admission control against a real Redis instance.

mod common;

use common::*;
use streaming_llm_gateway::error::GatewayError;
use streaming_llm_gateway::pool::ConnectionPoolManager;
use std::sync::Arc;

#[tokio::test]
async fn acquire_then_release_frees_the_slot() {
    let kv = setup_kv().await.expect("kv setup");
    let pool = Arc::new(ConnectionPoolManager::new(kv, 2, 2, 0.70, 0.90));
    let user = test_key("user");

    pool.acquire(&user, "t1").await.expect("first acquire");
    let stats_before = pool.stats().await;
    assert!(stats_before.utilization_percent > 0.0);

    pool.release(&user, "t1").await;
    let stats_after = pool.stats().await;
    assert!(stats_after.utilization_percent <= stats_before.utilization_percent);
}

#[tokio::test]
async fn per_user_limit_is_enforced() {
    let kv = setup_kv().await.expect("kv setup");
    let pool = Arc::new(ConnectionPoolManager::new(kv, 100, 1, 0.70, 0.90));
    let user = test_key("limited-user");

    pool.acquire(&user, "t1").await.expect("first acquire under the per-user limit");
    let second = pool.acquire(&user, "t2").await;

    assert!(matches!(second, Err(GatewayError::UserConnectionLimit)));

    pool.release(&user, "t1").await;
}
