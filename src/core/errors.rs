use thiserror::Error;

/// Error taxonomy for the RAG pipeline.
///
/// Ingestion errors (`SourceUnavailable`, `UnsupportedFormat`,
/// `EmptyDocument`) and `DimensionMismatch` describe request-shape defects
/// and are never retried. `EmbeddingService` and `GenerationService` are
/// transient transport failures and may be retried with backoff.
#[derive(Debug, Error)]
pub enum RagError {
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),
    #[error("empty document: {0}")]
    EmptyDocument(String),
    #[error("dimension mismatch: index has {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("embedding model mismatch: index built with {index_model}, query used {query_model}")]
    ModelMismatch {
        index_model: String,
        query_model: String,
    },
    #[error("embedding service error: {0}")]
    EmbeddingService(String),
    #[error("generation service error: {0}")]
    GenerationService(String),
    #[error("context too large: {tokens} tokens exceeds input limit of {limit}")]
    ContextTooLarge { tokens: usize, limit: usize },
    #[error("internal error: {0}")]
    Internal(String),
}

impl RagError {
    pub fn internal<E: std::fmt::Display>(err: E) -> Self {
        RagError::Internal(err.to_string())
    }

    /// Whether the retry helper is allowed to re-attempt the failed call.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RagError::EmbeddingService(_) | RagError::GenerationService(_)
        )
    }

    /// User-safe message. Raw service payloads stay in the log; the
    /// presentation layer only ever sees these strings.
    pub fn user_message(&self) -> String {
        match self {
            RagError::SourceUnavailable(_) => "The document source could not be read.".into(),
            RagError::UnsupportedFormat(_) => "The document format is not supported.".into(),
            RagError::EmptyDocument(_) => "The document contains no text.".into(),
            RagError::DimensionMismatch { .. } | RagError::ModelMismatch { .. } => {
                "The knowledge base needs to be reindexed.".into()
            }
            RagError::EmbeddingService(_) | RagError::GenerationService(_) => {
                "The assistant is temporarily unavailable. Please try again.".into()
            }
            RagError::ContextTooLarge { .. } => {
                "The question and its context are too long to process.".into()
            }
            RagError::Internal(_) => "An internal error occurred.".into(),
        }
    }
}
