//! End-to-end coverage of the six-stage pipeline against the fake provider.

mod common;

use common::*;
use futures_util::StreamExt;

#[tokio::test]
async fn full_pipeline_streams_chunks_then_completes() {
    let orchestrator = setup_orchestrator().await.expect("orchestrator setup");
    let request = sample_request(test_key("thread"), "hello there");

    let lines: Vec<String> = orchestrator.stream(request).collect().await;

    assert!(lines.iter().any(|l| l.starts_with("event: chunk")), "expected at least one chunk event, got: {lines:?}");
    assert!(lines.iter().any(|l| l.starts_with("event: complete")), "expected a terminal complete event, got: {lines:?}");
    assert!(lines.last().unwrap().contains("[DONE]"));
}

#[tokio::test]
async fn second_request_with_same_fingerprint_is_served_from_cache() {
    let orchestrator = setup_orchestrator().await.expect("orchestrator setup");
    let query = format!("cache me please {}", test_key("q"));

    let first = sample_request(test_key("thread-a"), query.clone());
    let lines_first: Vec<String> = orchestrator.clone().stream(first).collect().await;
    assert!(lines_first.iter().any(|l| l.starts_with("event: complete")));

    let second = sample_request(test_key("thread-b"), query);
    let lines_second: Vec<String> = orchestrator.stream(second).collect().await;

    assert!(lines_second.iter().any(|l| l.starts_with("event: status")), "cached path should emit a status event first");
    let complete_line = lines_second.iter().find(|l| l.starts_with("event: complete")).expect("complete event");
    assert!(complete_line.contains("\"cached\":true"));
}

#[tokio::test]
async fn invalid_request_yields_an_error_event_not_a_panic() {
    let orchestrator = setup_orchestrator().await.expect("orchestrator setup");
    let mut request = sample_request(test_key("thread"), "");
    request.model = "gpt-4".to_string();

    let lines: Vec<String> = orchestrator.stream(request).collect().await;

    assert!(lines.iter().any(|l| l.starts_with("event: error")), "empty query must be rejected, got: {lines:?}");
}
