//! Query-time retrieval: embed the query, search the index, threshold.

use std::sync::Arc;

use crate::core::config::RetrievalConfig;
use crate::core::errors::RagError;
use crate::embed::Embedder;
use crate::index::{MetadataFilter, RetrievalResult, VectorIndex};

pub struct Retriever {
    embedder: Embedder,
    index: Arc<VectorIndex>,
    config: RetrievalConfig,
}

impl Retriever {
    pub fn new(embedder: Embedder, index: Arc<VectorIndex>, config: RetrievalConfig) -> Self {
        Self {
            embedder,
            index,
            config,
        }
    }

    /// Retrieve the passages most relevant to `query_text`.
    ///
    /// Over-fetches `top_k * candidate_multiplier` candidates, discards
    /// scores below `min_score`, then truncates to `top_k`. An empty result
    /// means "no relevant context", which is a normal outcome the caller
    /// must handle, not an error.
    pub async fn retrieve(
        &self,
        query_text: &str,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<RetrievalResult>, RagError> {
        if self.index.is_empty().await {
            return Ok(Vec::new());
        }

        let query_vector = self.embedder.embed(query_text).await?;
        let candidate_k = self.config.top_k * self.config.candidate_multiplier.max(1);

        let candidates = self
            .index
            .query(
                &query_vector,
                self.embedder.model_id(),
                candidate_k,
                filter,
            )
            .await?;

        let mut results: Vec<RetrievalResult> = candidates
            .into_iter()
            .filter(|r| r.score >= self.config.min_score)
            .take(self.config.top_k)
            .collect();

        for (rank, result) in results.iter_mut().enumerate() {
            result.rank = rank;
        }

        tracing::debug!(
            "retrieved {} passages above threshold {} for query",
            results.len(),
            self.config.min_score
        );
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{Embedding, PassageSnapshot};
    use crate::ingest::loader::DocMeta;
    use crate::llm::{ChatRequest, LlmProvider};
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    /// Provider whose embeddings map known words onto fixed axes.
    struct AxisProvider;

    #[async_trait]
    impl LlmProvider for AxisProvider {
        fn name(&self) -> &str {
            "axis"
        }
        async fn health_check(&self) -> Result<bool, RagError> {
            Ok(true)
        }
        async fn chat(&self, _request: ChatRequest, _model_id: &str) -> Result<String, RagError> {
            Ok(String::new())
        }
        async fn stream_chat(
            &self,
            _request: ChatRequest,
            _model_id: &str,
        ) -> Result<mpsc::Receiver<Result<String, RagError>>, RagError> {
            let (_tx, rx) = mpsc::channel(1);
            Ok(rx)
        }
        async fn embed(
            &self,
            inputs: &[String],
            _model_id: &str,
        ) -> Result<Vec<Vec<f32>>, RagError> {
            Ok(inputs
                .iter()
                .map(|text| {
                    let lower = text.to_lowercase();
                    vec![
                        if lower.contains("life") { 1.0 } else { 0.0 },
                        if lower.contains("home") { 1.0 } else { 0.0 },
                        if lower.contains("travel") { 1.0 } else { 0.0 },
                    ]
                })
                .collect())
        }
    }

    fn snapshot(id: &str, text: &str) -> PassageSnapshot {
        PassageSnapshot {
            document_id: id.to_string(),
            source_uri: format!("{}.txt", id),
            ordinal: 0,
            text: text.to_string(),
            char_span: (0, text.len()),
            meta: DocMeta::default(),
        }
    }

    async fn seeded_retriever(config: RetrievalConfig) -> Retriever {
        let provider = Arc::new(AxisProvider);
        let embedder = Embedder::new(provider.clone(), "embed-v1");
        let index = Arc::new(VectorIndex::new());

        for (id, text) in [
            ("p-life", "life insurance terms"),
            ("p-home", "home coverage details"),
            ("p-travel", "travel policy notes"),
        ] {
            let vector = provider
                .embed(&[text.to_string()], "embed-v1")
                .await
                .unwrap()
                .pop()
                .unwrap();
            index
                .upsert(
                    Embedding {
                        passage_id: id.to_string(),
                        vector,
                        model_id: "embed-v1".to_string(),
                    },
                    snapshot(id, text),
                )
                .await
                .unwrap();
        }

        Retriever::new(embedder, index, config)
    }

    #[tokio::test]
    async fn results_are_sorted_and_above_threshold() {
        let retriever = seeded_retriever(RetrievalConfig {
            top_k: 3,
            candidate_multiplier: 4,
            min_score: 0.5,
        })
        .await;

        let results = retriever.retrieve("tell me about life cover", None).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].passage_id, "p-life");
        assert!(results[0].score >= 0.5);
        assert_eq!(results[0].rank, 0);
    }

    #[tokio::test]
    async fn no_match_returns_empty_not_error() {
        let retriever = seeded_retriever(RetrievalConfig {
            top_k: 3,
            candidate_multiplier: 4,
            min_score: 0.5,
        })
        .await;

        let results = retriever.retrieve("pension fund fees", None).await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn truncates_to_top_k_after_threshold() {
        let retriever = seeded_retriever(RetrievalConfig {
            top_k: 1,
            candidate_multiplier: 4,
            min_score: 0.0,
        })
        .await;

        let results = retriever.retrieve("life insurance", None).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].passage_id, "p-life");
    }
}
