//! Distributed circuit breaker state transitions against a real Redis
//! instance.

mod common;

use common::*;
use streaming_llm_gateway::circuit_breaker::{CircuitState, DistributedCircuitBreaker};
use std::time::Duration;

#[tokio::test]
async fn trips_open_after_max_failures_then_recovers() {
    let kv = setup_kv().await.expect("kv setup");
    let name = test_key("circuit");
    let circuit = DistributedCircuitBreaker::new(name, kv, 3, Duration::from_millis(50));

    assert_eq!(circuit.state().await, CircuitState::Closed);
    assert!(circuit.should_allow_request().await);

    for _ in 0..3 {
        circuit.record_failure().await;
    }
    assert_eq!(circuit.state().await, CircuitState::Open);
    assert!(!circuit.should_allow_request().await);

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(circuit.should_allow_request().await, "probe should be allowed once reset_timeout elapses");

    circuit.record_success().await;
    assert_eq!(circuit.state().await, CircuitState::Closed);
}
