use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::core::errors::RagError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub max_tokens: Option<i32>,
    pub stop: Option<Vec<String>>,
}

impl ChatRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            temperature: None,
            top_p: None,
            max_tokens: None,
            stop: None,
        }
    }
}

/// Opaque embedding/completion endpoint.
///
/// The two latency-dominant operations of the pipeline live behind this
/// trait; callers await them as suspension points and decide retry policy
/// themselves (see `llm::retry`).
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider name (e.g. "openai-compat", "mock").
    fn name(&self) -> &str;

    /// Check if the endpoint is reachable.
    async fn health_check(&self) -> Result<bool, RagError>;

    /// Chat completion (non-streaming).
    async fn chat(&self, request: ChatRequest, model_id: &str) -> Result<String, RagError>;

    /// Chat completion (streaming). The receiver yields a lazy, finite,
    /// non-restartable sequence of fragments; dropping it cancels the
    /// in-flight request.
    async fn stream_chat(
        &self,
        request: ChatRequest,
        model_id: &str,
    ) -> Result<mpsc::Receiver<Result<String, RagError>>, RagError>;

    /// Generate embeddings, one vector per input, in input order.
    /// Deterministic for a fixed model_id.
    async fn embed(&self, inputs: &[String], model_id: &str) -> Result<Vec<Vec<f32>>, RagError>;
}
