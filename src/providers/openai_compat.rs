//! OpenAI-compatible streaming provider adapter.
//!
//! The line-buffering SSE parser (`SseLineBuffer`) is carried over verbatim
//! from the pack's shared SSE client helper: it solves the same two
//! correctness problems here (multiple events per TCP chunk, partial JSON
//! split across chunk boundaries) against an upstream `/chat/completions`
//! stream instead of a provider-router's internal `ChatStream`.

use crate::error::GatewayError;
use crate::model::StreamChunk;
use crate::providers::LlmProvider;
use async_trait::async_trait;
use futures_util::stream::{unfold, BoxStream, StreamExt};
use std::collections::VecDeque;
use std::pin::Pin;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
enum SseEvent {
    Data(String),
    Done,
}

#[derive(Debug, Default)]
struct SseLineBuffer {
    buffer: String,
}

impl SseLineBuffer {
    fn feed(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.buffer.push_str(&String::from_utf8_lossy(bytes));
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.find('\n') {
            let line = self.buffer[..pos].trim_end_matches('\r').to_owned();
            self.buffer = self.buffer[pos + 1..].to_owned();
            let trimmed = line.trim();

            if trimmed.is_empty() {
                continue;
            }
            if trimmed == "data: [DONE]" {
                events.push(SseEvent::Done);
                continue;
            }
            if let Some(data) = trimmed.strip_prefix("data: ") {
                if !data.trim().is_empty() {
                    events.push(SseEvent::Data(data.to_owned()));
                }
            }
        }
        events
    }

    fn flush(&mut self) -> Vec<SseEvent> {
        let remaining = std::mem::take(&mut self.buffer);
        let trimmed = remaining.trim();
        if trimmed.is_empty() || trimmed == "data: [DONE]" {
            return if trimmed == "data: [DONE]" { vec![SseEvent::Done] } else { Vec::new() };
        }
        match trimmed.strip_prefix("data: ") {
            Some(data) if !data.trim().is_empty() => vec![SseEvent::Data(data.to_owned())],
            _ => Vec::new(),
        }
    }
}

/// One OpenAI-compatible delta chunk, as returned by the `/chat/completions`
/// streaming endpoint (`choices[0].delta.content` / `finish_reason`).
#[derive(Debug, serde::Deserialize)]
struct OpenAiChunk {
    choices: Vec<OpenAiChoice>,
}

#[derive(Debug, serde::Deserialize)]
struct OpenAiChoice {
    delta: OpenAiDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Default, serde::Deserialize)]
struct OpenAiDelta {
    #[serde(default)]
    content: String,
}

pub struct OpenAiCompatProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    models: Vec<String>,
}

impl OpenAiCompatProvider {
    #[must_use]
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, models: Vec<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            models,
        }
    }
}

#[async_trait]
impl LlmProvider for OpenAiCompatProvider {
    fn name(&self) -> &'static str {
        "openai_compat"
    }

    fn supports_model(&self, model: &str) -> bool {
        self.models.iter().any(|m| m == model)
    }

    async fn stream(&self, query: &str, model: &str) -> Result<BoxStream<'static, Result<StreamChunk, GatewayError>>, GatewayError> {
        let body = serde_json::json!({
            "model": model,
            "messages": [{"role": "user", "content": query}],
            "stream": true,
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if crate::retry::is_retryable_request_error(&e) {
                    GatewayError::ProviderTimeout(e.to_string())
                } else {
                    GatewayError::ProviderApi(e.to_string())
                }
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(GatewayError::ProviderAuth(format!("status {status}")));
        }
        if crate::retry::is_retryable_status(status.as_u16()) {
            return Err(GatewayError::ProviderNotAvailable(format!("status {status}")));
        }
        if !status.is_success() {
            return Err(GatewayError::ProviderApi(format!("status {status}")));
        }

        let model = model.to_string();
        let byte_stream = response.bytes_stream();
        let state = (SseLineBuffer::default(), VecDeque::new(), false);

        let stream = unfold(
            (Box::pin(byte_stream) as Pin<Box<dyn futures_util::Stream<Item = reqwest::Result<bytes::Bytes>> + Send>>, state, model),
            |(mut byte_stream, (mut parser, mut pending, mut ended), model)| async move {
                loop {
                    if let Some(item) = pending.pop_front() {
                        return Some((item, (byte_stream, (parser, pending, ended), model)));
                    }
                    if ended {
                        return None;
                    }

                    match byte_stream.next().await {
                        Some(Ok(bytes)) => {
                            for event in parser.feed(&bytes) {
                                push_event(event, &model, &mut pending);
                            }
                        }
                        Some(Err(e)) => {
                            ended = true;
                            return Some((
                                Err(GatewayError::StreamingTimeout(e.to_string())),
                                (byte_stream, (parser, pending, ended), model),
                            ));
                        }
                        None => {
                            ended = true;
                            for event in parser.flush() {
                                push_event(event, &model, &mut pending);
                            }
                        }
                    }
                }
            },
        );

        Ok(Box::pin(stream))
    }
}

fn push_event(event: SseEvent, model: &str, pending: &mut VecDeque<Result<StreamChunk, GatewayError>>) {
    match event {
        SseEvent::Data(json) => match serde_json::from_str::<OpenAiChunk>(&json) {
            Ok(parsed) => {
                if let Some(choice) = parsed.choices.into_iter().next() {
                    pending.push_back(Ok(StreamChunk::now(model, choice.delta.content, choice.finish_reason)));
                }
            }
            Err(_) => { /* non-delta event (e.g. role-only first chunk); ignore */ }
        },
        SseEvent::Done => pending.push_back(Ok(StreamChunk::now(model, String::new(), Some("stop".to_string())))),
    }
}

#[allow(dead_code)]
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_buffer_handles_partial_json_across_feeds() {
        let mut buf = SseLineBuffer::default();
        let events = buf.feed(b"data: {\"choices\":[{\"delta\":{\"con");
        assert!(events.is_empty());
        let events = buf.feed(b"tent\":\"hi\"},\"finish_reason\":null}]}\n\n");
        assert_eq!(events, vec![SseEvent::Data("{\"choices\":[{\"delta\":{\"content\":\"hi\"},\"finish_reason\":null}]}".to_string())]);
    }

    #[test]
    fn line_buffer_detects_done() {
        let mut buf = SseLineBuffer::default();
        let events = buf.feed(b"data: [DONE]\n");
        assert_eq!(events, vec![SseEvent::Done]);
    }
}
