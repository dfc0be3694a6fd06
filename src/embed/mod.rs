//! Embedder facade pinning the active embedding model.
//!
//! Index and query vectors must come from the same model_id; the facade is
//! the single place that model id is decided, so every vector that reaches
//! the index carries it.

use std::sync::Arc;

use crate::core::errors::RagError;
use crate::llm::LlmProvider;

#[derive(Clone)]
pub struct Embedder {
    provider: Arc<dyn LlmProvider>,
    model_id: String,
}

impl Embedder {
    pub fn new(provider: Arc<dyn LlmProvider>, model_id: impl Into<String>) -> Self {
        Self {
            provider,
            model_id: model_id.into(),
        }
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    /// Embed a single string (the query-time path).
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>, RagError> {
        let mut vectors = self.provider.embed(&[text.to_string()], &self.model_id).await?;
        vectors
            .pop()
            .ok_or_else(|| RagError::EmbeddingService("provider returned no vector".into()))
    }

    /// Embed a batch (the ingestion path). Semantics are identical to
    /// repeated single calls; the batch exists for throughput only.
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RagError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        self.provider.embed(texts, &self.model_id).await
    }
}
