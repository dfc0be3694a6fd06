//! The answer pipeline: retrieve, assemble, generate, remember.
//!
//! `ChatEngine` owns the stages and wires them together; each stage stays
//! independently testable behind its own module. Per-session requests are
//! serialized with the conversation manager's session lock so history
//! appends never interleave.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::context::{Citation, ContextAssembler, ContextBlock, ScoredPassage};
use crate::context::prompt::{compose_messages, total_tokens};
use crate::core::config::RagConfig;
use crate::core::errors::RagError;
use crate::core::tokens::estimate_tokens;
use crate::embed::Embedder;
use crate::index::{Embedding, MetadataFilter, PassageSnapshot, VectorIndex};
use crate::ingest::{chunk, Document};
use crate::llm::{with_retry, ChatRequest, LlmProvider};
use crate::retrieve::Retriever;
use crate::session::{ConversationManager, Role, Turn};

/// A grounded answer: the response text plus the passages it drew on.
/// `citations` is empty when no relevant context was found.
#[derive(Debug, Clone)]
pub struct Answer {
    pub text: String,
    pub citations: Vec<Citation>,
}

pub struct ChatEngine {
    provider: Arc<dyn LlmProvider>,
    embedder: Embedder,
    index: Arc<VectorIndex>,
    retriever: Retriever,
    sessions: ConversationManager,
    config: RagConfig,
}

impl ChatEngine {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        index: Arc<VectorIndex>,
        sessions: ConversationManager,
        config: RagConfig,
    ) -> Self {
        let embedder = Embedder::new(provider.clone(), config.provider.embedding_model.clone());
        let retriever = Retriever::new(embedder.clone(), index.clone(), config.retrieval.clone());
        Self {
            provider,
            embedder,
            index,
            retriever,
            sessions,
            config,
        }
    }

    pub fn index(&self) -> &Arc<VectorIndex> {
        &self.index
    }

    pub fn sessions(&self) -> &ConversationManager {
        &self.sessions
    }

    /// Chunk, embed and index a batch of documents. Returns the number of
    /// passages indexed. A dimension or model mismatch halts the batch with
    /// the index unchanged.
    pub async fn ingest(&self, documents: &[Document]) -> Result<usize, RagError> {
        let mut items: Vec<(Embedding, PassageSnapshot)> = Vec::new();

        for document in documents {
            let passages = chunk(
                document,
                self.config.chunking.max_tokens,
                self.config.chunking.overlap_tokens,
            )?;
            tracing::info!(
                "chunked {} into {} passages",
                document.source_uri,
                passages.len()
            );

            let texts: Vec<String> = passages.iter().map(|p| p.text.clone()).collect();
            let vectors = with_retry(&self.config.retry, || {
                self.embedder.embed_batch(&texts)
            })
            .await?;
            if vectors.len() != passages.len() {
                return Err(RagError::EmbeddingService(format!(
                    "expected {} vectors, got {}",
                    passages.len(),
                    vectors.len()
                )));
            }

            for (passage, vector) in passages.iter().zip(vectors) {
                items.push((
                    Embedding {
                        passage_id: passage.id.clone(),
                        vector,
                        model_id: self.embedder.model_id().to_string(),
                    },
                    PassageSnapshot::from(passage),
                ));
            }
        }

        let count = items.len();
        self.index.upsert_batch(items).await?;
        tracing::info!("indexed {} passages from {} documents", count, documents.len());
        Ok(count)
    }

    /// Answer a query within a session.
    ///
    /// The session's per-id lock is held for the whole request, so two
    /// concurrent queries in one session run one after the other. An expired
    /// session id is accepted and simply starts over with empty history.
    pub async fn answer(&self, session_id: &str, query_text: &str) -> Result<Answer, RagError> {
        self.answer_filtered(session_id, query_text, None).await
    }

    pub async fn answer_filtered(
        &self,
        session_id: &str,
        query_text: &str,
        filter: Option<&MetadataFilter>,
    ) -> Result<Answer, RagError> {
        let lock = self.sessions.session_lock(session_id).await;
        let _guard = lock.lock().await;

        let (messages, context) = self.prepare(session_id, query_text, filter).await?;

        let response = with_retry(&self.config.retry, || {
            self.provider.chat(
                ChatRequest::new(messages.clone()),
                &self.config.provider.generation_model,
            )
        })
        .await?;

        self.sessions
            .append_turn(session_id, Role::User, query_text)
            .await?;
        self.sessions
            .append_turn(session_id, Role::Assistant, &response)
            .await?;

        Ok(Answer {
            text: response,
            citations: context.citations(),
        })
    }

    /// Streaming variant of [`answer`](Self::answer).
    ///
    /// Fragments arrive on the returned receiver as the model produces them;
    /// dropping the receiver cancels generation. Citations are known up
    /// front since the context is assembled before the call. The session
    /// turns are appended once the stream completes, so an abandoned stream
    /// leaves no half-recorded exchange.
    pub async fn answer_stream(
        &self,
        session_id: &str,
        query_text: &str,
    ) -> Result<(mpsc::Receiver<Result<String, RagError>>, Vec<Citation>), RagError> {
        let lock = self.sessions.session_lock(session_id).await;
        let guard = lock.clone().lock_owned().await;

        let (messages, context) = self.prepare(session_id, query_text, None).await?;

        let mut upstream = self
            .provider
            .stream_chat(
                ChatRequest::new(messages),
                &self.config.provider.generation_model,
            )
            .await?;

        let (tx, rx) = mpsc::channel::<Result<String, RagError>>(32);
        let sessions_store = self.sessions.store().clone();
        let session_id = session_id.to_string();
        let query_text = query_text.to_string();

        tokio::spawn(async move {
            let _guard = guard;
            let mut full = String::new();
            let mut failed = false;

            while let Some(fragment) = upstream.recv().await {
                match &fragment {
                    Ok(text) => full.push_str(text),
                    Err(_) => failed = true,
                }
                if tx.send(fragment).await.is_err() {
                    // Receiver dropped: cancel by dropping the upstream.
                    return;
                }
                if failed {
                    return;
                }
            }

            if let Err(err) = sessions_store
                .append_turn(&session_id, Role::User, &query_text)
                .await
            {
                tracing::error!("failed to record user turn: {}", err);
                return;
            }
            if let Err(err) = sessions_store
                .append_turn(&session_id, Role::Assistant, &full)
                .await
            {
                tracing::error!("failed to record assistant turn: {}", err);
            }
        });

        Ok((rx, context.citations()))
    }

    /// Shared front half of both answer paths: session expiry, retrieval,
    /// context assembly, history trimming and the input-limit pre-check.
    async fn prepare(
        &self,
        session_id: &str,
        query_text: &str,
        filter: Option<&MetadataFilter>,
    ) -> Result<(Vec<crate::llm::ChatMessage>, ContextBlock), RagError> {
        self.sessions.resolve(session_id).await?;

        let results = with_retry(&self.config.retry, || {
            self.retriever.retrieve(query_text, filter)
        })
        .await?;

        let ids: Vec<String> = results.iter().map(|r| r.passage_id.clone()).collect();
        let snapshots = self.index.snapshots(&ids).await;
        let scored: Vec<ScoredPassage> = results
            .iter()
            .zip(snapshots)
            .map(|(result, snapshot)| ScoredPassage {
                snapshot,
                score: result.score,
            })
            .collect();

        let history = self
            .sessions
            .history(session_id, self.config.context.max_history_turns)
            .await?;
        let history = trim_history(history, self.config.context.history_budget);

        let context = ContextAssembler::assemble(scored.clone(), self.config.context.context_budget);
        let messages = compose_messages(&context, &history, query_text);

        let limit = self.config.context.model_input_limit;
        if total_tokens(&messages) <= limit {
            return Ok((messages, context));
        }

        // One shot at fitting: halve the context budget and reassemble.
        let context = ContextAssembler::assemble(scored, self.config.context.context_budget / 2);
        let messages = compose_messages(&context, &history, query_text);
        let tokens = total_tokens(&messages);
        if tokens > limit {
            return Err(RagError::ContextTooLarge { tokens, limit });
        }
        Ok((messages, context))
    }
}

/// Drop oldest turns until the remainder fits the history token budget.
fn trim_history(turns: Vec<Turn>, budget: usize) -> Vec<Turn> {
    let mut total = 0usize;
    let mut keep = 0usize;
    for turn in turns.iter().rev() {
        let tokens = estimate_tokens(&turn.text);
        if total + tokens > budget {
            break;
        }
        total += tokens;
        keep += 1;
    }
    let skip = turns.len() - keep;
    turns.into_iter().skip(skip).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn turn(text: &str) -> Turn {
        Turn {
            role: Role::User,
            text: text.to_string(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn trim_history_drops_oldest_first() {
        let turns = vec![
            turn(&"a".repeat(400)), // ~100 tokens
            turn(&"b".repeat(400)),
            turn(&"c".repeat(400)),
        ];
        let kept = trim_history(turns, 210);
        assert_eq!(kept.len(), 2);
        assert!(kept[0].text.starts_with('b'));
        assert!(kept[1].text.starts_with('c'));
    }

    #[test]
    fn trim_history_keeps_everything_under_budget() {
        let turns = vec![turn("short"), turn("also short")];
        assert_eq!(trim_history(turns, 1000).len(), 2);
    }
}
