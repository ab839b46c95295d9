//! LLM provider adapters: §4.6.
//!
//! `LlmProvider` is the seam between the orchestrator and an upstream model
//! endpoint, named and shaped after the pack's own `LLMProviderType`/`LLMError`
//! split (`castingclouds` LLM routing module), generalized from a
//! multi-provider router to the single-call-per-attempt shape the gateway's
//! resilience wrapper expects (one provider call, wrapped by
//! `retry::call_with_retry`, per §4.4).

pub mod fake;
pub mod openai_compat;

use crate::error::GatewayError;
use crate::model::StreamChunk;
use async_trait::async_trait;
use futures_util::stream::BoxStream;

/// One upstream LLM backend. `stream` returns a stream of chunks; the first
/// chunk not arriving within the configured first-chunk timeout is the
/// orchestrator's job to enforce, not the provider's.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether this provider claims to support `model`.
    fn supports_model(&self, model: &str) -> bool;

    async fn stream(&self, query: &str, model: &str) -> Result<BoxStream<'static, Result<StreamChunk, GatewayError>>, GatewayError>;
}

/// Ordered list of providers to try for a request; §4.6 failover walks this
/// list front-to-back, stopping at the first that accepts the call.
pub struct ProviderRegistry {
    providers: Vec<std::sync::Arc<dyn LlmProvider>>,
}

impl ProviderRegistry {
    #[must_use]
    pub fn new(providers: Vec<std::sync::Arc<dyn LlmProvider>>) -> Self {
        Self { providers }
    }

    /// Requested provider by name if given and known, else every provider
    /// that supports the requested model, in registration order.
    #[must_use]
    pub fn candidates(&self, requested: Option<&str>, model: &str) -> Vec<std::sync::Arc<dyn LlmProvider>> {
        if let Some(name) = requested {
            return self
                .providers
                .iter()
                .filter(|p| p.name() == name)
                .cloned()
                .collect();
        }
        self.providers
            .iter()
            .filter(|p| p.supports_model(model))
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<std::sync::Arc<dyn LlmProvider>> {
        self.providers.iter().find(|p| p.name() == name).cloned()
    }
}
