//! Wire and in-process data model: §3 of the specification.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    High,
    Normal,
    Low,
}

impl Default for Priority {
    fn default() -> Self {
        Self::Normal
    }
}

/// Immutable value object describing one client request. Owned by the
/// orchestrator for the duration of the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamRequest {
    pub query: String,
    pub model: String,
    #[serde(default)]
    pub provider: Option<String>,
    pub thread_id: String,
    pub user_id: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

pub const MAX_QUERY_BYTES: usize = 100 * 1024;

impl StreamRequest {
    /// Stage 1 validation: non-empty query within bounds, non-empty model.
    /// Disallowed-pattern blocklist covers the obvious injection markers the
    /// original validator rejects (`validators/stream_validator.py`).
    pub fn validate(&self) -> Result<(), crate::error::GatewayError> {
        use crate::error::GatewayError;

        if self.query.trim().is_empty() {
            return Err(GatewayError::InvalidInput("query must not be empty".into()));
        }
        if self.query.len() > MAX_QUERY_BYTES {
            return Err(GatewayError::InvalidInput(format!(
                "query exceeds {MAX_QUERY_BYTES} bytes"
            )));
        }
        if self.model.trim().is_empty() {
            return Err(GatewayError::InvalidModel("model must not be empty".into()));
        }
        const BLOCKLIST: &[&str] = &["<script", "ignore previous instructions", "\0"];
        let lowered = self.query.to_lowercase();
        for marker in BLOCKLIST {
            if lowered.contains(marker) {
                return Err(GatewayError::InvalidInput(format!(
                    "query contains a disallowed pattern: {marker}"
                )));
            }
        }
        Ok(())
    }

    /// Stable cache fingerprint: `H(query \0 model \0 provider \0)`.
    /// A present-but-different provider must produce a different key from an
    /// absent provider, hence the explicit separator on every field.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let provider = self.provider.as_deref().unwrap_or("");
        let mut buf = Vec::with_capacity(self.query.len() + self.model.len() + provider.len() + 3);
        buf.extend_from_slice(self.query.as_bytes());
        buf.push(0);
        buf.extend_from_slice(self.model.as_bytes());
        buf.push(0);
        buf.extend_from_slice(provider.as_bytes());
        buf.push(0);
        let hash = blake3::hash(&buf);
        format!("cache:response:{}", hash.to_hex())
    }
}

/// Produced by an adapter, consumed by the orchestrator. Never retained past
/// Stage 6 beyond the in-memory concat buffer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamChunk {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub finish_reason: Option<String>,
    pub model: String,
    pub timestamp: f64,
}

impl StreamChunk {
    #[must_use]
    pub fn now(model: &str, content: impl Into<String>, finish_reason: Option<String>) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        Self {
            content: content.into(),
            finish_reason,
            model: model.to_string(),
            timestamp,
        }
    }
}

/// SSE event types per §6. Each carries its own JSON-serializable payload;
/// `to_wire` produces the exact framing the client parses.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum SSEEvent {
    Status { data: String },
    Chunk { content: String, #[serde(skip_serializing_if = "Option::is_none")] cached: Option<bool>, #[serde(skip_serializing_if = "Option::is_none")] index: Option<usize> },
    Error { error: String, message: String },
    Complete {
        thread_id: String,
        chunk_count: usize,
        total_length: usize,
        duration_ms: u64,
        cached: bool,
    },
    Heartbeat,
}

impl SSEEvent {
    fn event_name(&self) -> &'static str {
        match self {
            Self::Status { .. } => "status",
            Self::Chunk { .. } => "chunk",
            Self::Error { .. } => "error",
            Self::Complete { .. } => "complete",
            Self::Heartbeat => "heartbeat",
        }
    }

    /// Whether this event terminates the stream. At most one per request.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Error { .. } | Self::Complete { .. })
    }

    /// Render the `event:`/`data:` wire framing described in §6. `status` and
    /// `heartbeat` carry a raw string payload; the rest carry JSON.
    #[must_use]
    pub fn to_wire(&self) -> String {
        let data = match self {
            Self::Status { data } => data.clone(),
            Self::Heartbeat => "ping".to_string(),
            Self::Chunk { content, cached, index } => {
                serde_json::json!({"content": content, "cached": cached, "index": index}).to_string()
            }
            Self::Error { error, message } => {
                serde_json::json!({"error": error, "message": message}).to_string()
            }
            Self::Complete {
                thread_id,
                chunk_count,
                total_length,
                duration_ms,
                cached,
            } => serde_json::json!({
                "thread_id": thread_id,
                "chunk_count": chunk_count,
                "total_length": total_length,
                "duration_ms": duration_ms,
                "cached": cached,
            })
            .to_string(),
        };
        let mut out = format!("event: {}\ndata: {}\n\n", self.event_name(), data);
        if self.is_terminal() {
            out.push_str("data: [DONE]\n\n");
        }
        out
    }
}

/// Wire-serializable envelope placed on the failover topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedStreamingRequest {
    pub request_id: String,
    pub payload: StreamRequest,
    pub enqueue_time: f64,
    pub retry_count: u32,
}

impl QueuedStreamingRequest {
    #[must_use]
    pub fn new(request_id: String, payload: StreamRequest) -> Self {
        let enqueue_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        Self {
            request_id,
            payload,
            enqueue_time,
            retry_count: 0,
        }
    }

    #[must_use]
    pub fn age_secs(&self) -> f64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        (now - self.enqueue_time).max(0.0)
    }
}

/// One timed segment of a request's execution, §4.9. Substages nest; a
/// top-level `StageExecution` has no parent and is stored under its
/// `thread_id` until `clear_thread_data` frees it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageExecution {
    pub stage_id: String,
    pub stage_name: String,
    pub thread_id: String,
    pub started_at: f64,
    pub ended_at: Option<f64>,
    pub duration_ms: Option<f64>,
    pub success: Option<bool>,
    pub error: Option<String>,
    pub substages: Vec<StageExecution>,
}
