//! Deterministic fake provider, gated by `GatewayConfig::use_fake_llm`.
//!
//! Grounded on the mock-streaming-response path in the pack's gateway
//! handler (`ccheney-reflex`): a short, fixed sequence of chunks followed by
//! a `finish_reason`. Useful for integration tests and local development
//! without a real upstream key.

use crate::error::GatewayError;
use crate::model::StreamChunk;
use crate::providers::LlmProvider;
use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};

pub struct FakeProvider;

#[async_trait]
impl LlmProvider for FakeProvider {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn supports_model(&self, _model: &str) -> bool {
        true
    }

    async fn stream(&self, query: &str, model: &str) -> Result<BoxStream<'static, Result<StreamChunk, GatewayError>>, GatewayError> {
        let words: Vec<String> = format!("Echo: {query}").split_whitespace().map(str::to_string).collect();
        let model = model.to_string();
        let total = words.len();

        let s = stream::iter(words.into_iter().enumerate()).then(move |(i, word)| {
            let model = model.clone();
            async move {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                let finish_reason = if i + 1 == total { Some("stop".to_string()) } else { None };
                Ok(StreamChunk::now(&model, format!("{word} "), finish_reason))
            }
        });

        Ok(Box::pin(s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt as _;

    #[tokio::test]
    async fn streams_terminal_finish_reason() {
        let provider = FakeProvider;
        let mut stream = provider.stream("hello world", "gpt-4").await.unwrap();
        let mut last_finish = None;
        let mut count = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.unwrap();
            last_finish = chunk.finish_reason;
            count += 1;
        }
        assert!(count > 0);
        assert_eq!(last_finish.as_deref(), Some("stop"));
    }
}
