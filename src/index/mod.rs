//! In-process vector index.
//!
//! Brute-force cosine search over unit-normalized vectors. Vectors are
//! normalized once at insertion, so query-time similarity is a plain dot
//! product. Readers take the lock shared and writers exclusive, so queries
//! always observe a consistent snapshot while ingestion runs concurrently.
//!
//! The index pins its dimension and embedding model id on first insert and
//! rejects anything that disagrees: mixed-model vectors in one index are a
//! correctness bug, not a performance one.

pub mod snapshot;

use std::cmp::Ordering;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::core::errors::RagError;
use crate::ingest::loader::DocMeta;
use crate::ingest::Passage;

/// A passage vector under a specific embedding model.
#[derive(Debug, Clone)]
pub struct Embedding {
    pub passage_id: String,
    pub vector: Vec<f32>,
    pub model_id: String,
}

/// The passage data the index snapshots alongside each vector, enough to
/// resolve results to prompt text and citations without a second store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PassageSnapshot {
    pub document_id: String,
    pub source_uri: String,
    pub ordinal: usize,
    pub text: String,
    /// Byte span over the normalized document text; lets the assembler
    /// merge adjacent passages without duplicating their overlap.
    pub char_span: (usize, usize),
    pub meta: DocMeta,
}

impl From<&Passage> for PassageSnapshot {
    fn from(passage: &Passage) -> Self {
        Self {
            document_id: passage.document_id.clone(),
            source_uri: passage.source_uri.clone(),
            ordinal: passage.ordinal,
            text: passage.text.clone(),
            char_span: passage.char_span,
            meta: passage.meta.clone(),
        }
    }
}

/// One ranked hit of a k-nearest-neighbor query. Transient, never persisted.
#[derive(Debug, Clone)]
pub struct RetrievalResult {
    pub passage_id: String,
    pub score: f32,
    pub rank: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterField {
    ProductCategory,
    SourceUri,
    Title,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    Equals,
    NotEquals,
    Contains,
}

/// Closed metadata predicate, evaluated before truncation to k so filtered
/// queries never come back under-filled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataFilter {
    pub field: FilterField,
    pub op: FilterOp,
    pub value: String,
}

impl MetadataFilter {
    pub fn matches(&self, snapshot: &PassageSnapshot) -> bool {
        let field = match self.field {
            FilterField::ProductCategory => snapshot.meta.product_category.as_str(),
            FilterField::SourceUri => snapshot.source_uri.as_str(),
            FilterField::Title => snapshot.meta.title.as_str(),
        };
        match self.op {
            FilterOp::Equals => field == self.value,
            FilterOp::NotEquals => field != self.value,
            FilterOp::Contains => field.contains(&self.value),
        }
    }
}

#[derive(Debug)]
struct StoredEntry {
    passage_id: String,
    /// Unit-normalized at insertion.
    vector: Vec<f32>,
    snapshot: PassageSnapshot,
}

#[derive(Debug, Default)]
struct IndexInner {
    dim: Option<usize>,
    model_id: Option<String>,
    entries: Vec<StoredEntry>,
    by_id: HashMap<String, usize>,
}

impl IndexInner {
    fn check_vector(&self, vector: &[f32], model_id: &str) -> Result<(), RagError> {
        if let Some(dim) = self.dim {
            if vector.len() != dim {
                return Err(RagError::DimensionMismatch {
                    expected: dim,
                    actual: vector.len(),
                });
            }
        }
        if let Some(index_model) = &self.model_id {
            if index_model != model_id {
                return Err(RagError::ModelMismatch {
                    index_model: index_model.clone(),
                    query_model: model_id.to_string(),
                });
            }
        }
        Ok(())
    }

    fn insert(&mut self, embedding: Embedding, snapshot: PassageSnapshot) {
        self.dim.get_or_insert(embedding.vector.len());
        self.model_id.get_or_insert(embedding.model_id);

        let entry = StoredEntry {
            passage_id: embedding.passage_id.clone(),
            vector: normalize(embedding.vector),
            snapshot,
        };

        if let Some(&idx) = self.by_id.get(&embedding.passage_id) {
            self.entries[idx] = entry;
        } else {
            self.by_id
                .insert(embedding.passage_id, self.entries.len());
            self.entries.push(entry);
        }
    }
}

/// Single-process vector index over one corpus.
#[derive(Debug, Default)]
pub struct VectorIndex {
    inner: RwLock<IndexInner>,
}

impl VectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the entry for a passage id.
    ///
    /// Fails with `DimensionMismatch`/`ModelMismatch` without touching the
    /// index when the vector disagrees with what the index was built with.
    pub async fn upsert(
        &self,
        embedding: Embedding,
        snapshot: PassageSnapshot,
    ) -> Result<(), RagError> {
        let mut inner = self.inner.write().await;
        inner.check_vector(&embedding.vector, &embedding.model_id)?;
        inner.insert(embedding, snapshot);
        Ok(())
    }

    /// Insert a batch atomically: the whole batch is validated before any
    /// entry is written, so model/dimension drift halts ingestion of the
    /// batch with the index unchanged.
    pub async fn upsert_batch(
        &self,
        items: Vec<(Embedding, PassageSnapshot)>,
    ) -> Result<(), RagError> {
        if items.is_empty() {
            return Ok(());
        }
        let mut inner = self.inner.write().await;

        let (first_dim, first_model) = match (inner.dim, &inner.model_id) {
            (Some(dim), Some(model)) => (dim, model.clone()),
            _ => (items[0].0.vector.len(), items[0].0.model_id.clone()),
        };
        for (embedding, _) in &items {
            if embedding.vector.len() != first_dim {
                return Err(RagError::DimensionMismatch {
                    expected: first_dim,
                    actual: embedding.vector.len(),
                });
            }
            if embedding.model_id != first_model {
                return Err(RagError::ModelMismatch {
                    index_model: first_model.clone(),
                    query_model: embedding.model_id.clone(),
                });
            }
        }

        for (embedding, snapshot) in items {
            inner.insert(embedding, snapshot);
        }
        Ok(())
    }

    /// k-nearest-neighbor query, descending cosine similarity.
    ///
    /// `filter` restricts candidates before truncation to `k`. The query
    /// vector must match the index's dimension and embedding model.
    pub async fn query(
        &self,
        vector: &[f32],
        model_id: &str,
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<RetrievalResult>, RagError> {
        let inner = self.inner.read().await;
        if inner.entries.is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        inner.check_vector(vector, model_id)?;

        let query = normalize(vector.to_vec());
        let mut scored: Vec<(f32, &StoredEntry)> = inner
            .entries
            .iter()
            .filter(|entry| filter.map_or(true, |f| f.matches(&entry.snapshot)))
            .map(|entry| (dot(&query, &entry.vector), entry))
            .collect();

        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.1.passage_id.cmp(&b.1.passage_id))
        });
        scored.truncate(k);

        Ok(scored
            .into_iter()
            .enumerate()
            .map(|(rank, (score, entry))| RetrievalResult {
                passage_id: entry.passage_id.clone(),
                score,
                rank,
            })
            .collect())
    }

    /// Resolve passage ids to their stored snapshots, preserving order.
    pub async fn snapshots(&self, passage_ids: &[String]) -> Vec<PassageSnapshot> {
        let inner = self.inner.read().await;
        passage_ids
            .iter()
            .filter_map(|id| inner.by_id.get(id).map(|&idx| inner.entries[idx].snapshot.clone()))
            .collect()
    }

    pub async fn delete(&self, passage_id: &str) -> bool {
        let mut inner = self.inner.write().await;
        let Some(idx) = inner.by_id.remove(passage_id) else {
            return false;
        };
        inner.entries.swap_remove(idx);
        if idx < inner.entries.len() {
            let moved_id = inner.entries[idx].passage_id.clone();
            inner.by_id.insert(moved_id, idx);
        }
        true
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn model_id(&self) -> Option<String> {
        self.inner.read().await.model_id.clone()
    }

    pub async fn dim(&self) -> Option<usize> {
        self.inner.read().await.dim
    }

    /// Recompute the index structure from current entries. Brute force has
    /// no graph to rebuild; this re-normalizes vectors and compacts the id
    /// map, and keeps the contract stable if an ANN structure replaces it.
    pub async fn rebuild(&self) {
        let mut inner = self.inner.write().await;
        for entry in &mut inner.entries {
            let v = std::mem::take(&mut entry.vector);
            entry.vector = normalize(v);
        }
        let by_id = inner
            .entries
            .iter()
            .enumerate()
            .map(|(idx, e)| (e.passage_id.clone(), idx))
            .collect();
        inner.by_id = by_id;
    }
}

fn normalize(mut vector: Vec<f32>) -> Vec<f32> {
    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in &mut vector {
            *x /= norm;
        }
    }
    vector
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(document_id: &str, ordinal: usize, category: &str) -> PassageSnapshot {
        PassageSnapshot {
            document_id: document_id.to_string(),
            source_uri: format!("{}.txt", document_id),
            ordinal,
            text: format!("passage {} of {}", ordinal, document_id),
            char_span: (ordinal * 100, ordinal * 100 + 20),
            meta: DocMeta {
                title: document_id.to_string(),
                product_category: category.to_string(),
                effective_date: None,
            },
        }
    }

    fn embedding(id: &str, vector: Vec<f32>) -> Embedding {
        Embedding {
            passage_id: id.to_string(),
            vector,
            model_id: "embed-v1".to_string(),
        }
    }

    #[tokio::test]
    async fn query_orders_by_descending_similarity() {
        let index = VectorIndex::new();
        index
            .upsert(embedding("p1", vec![1.0, 0.0]), snapshot("d1", 0, "life"))
            .await
            .unwrap();
        index
            .upsert(embedding("p2", vec![0.7, 0.7]), snapshot("d1", 1, "life"))
            .await
            .unwrap();
        index
            .upsert(embedding("p3", vec![0.0, 1.0]), snapshot("d2", 0, "home"))
            .await
            .unwrap();

        let results = index.query(&[1.0, 0.0], "embed-v1", 3, None).await.unwrap();
        let ids: Vec<&str> = results.iter().map(|r| r.passage_id.as_str()).collect();
        assert_eq!(ids, vec!["p1", "p2", "p3"]);
        for pair in results.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
        assert_eq!(results[0].rank, 0);
        assert!(results[0].score > 0.99);
    }

    #[tokio::test]
    async fn dimension_mismatch_leaves_index_unchanged() {
        let index = VectorIndex::new();
        index
            .upsert(embedding("p1", vec![1.0, 0.0, 0.0]), snapshot("d1", 0, "life"))
            .await
            .unwrap();

        let err = index
            .upsert(embedding("p2", vec![1.0, 0.0]), snapshot("d1", 1, "life"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RagError::DimensionMismatch {
                expected: 3,
                actual: 2
            }
        ));
        assert_eq!(index.len().await, 1);
    }

    #[tokio::test]
    async fn batch_with_drift_is_rejected_atomically() {
        let index = VectorIndex::new();
        let items = vec![
            (embedding("p1", vec![1.0, 0.0]), snapshot("d1", 0, "life")),
            (
                Embedding {
                    passage_id: "p2".into(),
                    vector: vec![0.0, 1.0],
                    model_id: "embed-v2".into(),
                },
                snapshot("d1", 1, "life"),
            ),
        ];
        assert!(matches!(
            index.upsert_batch(items).await.unwrap_err(),
            RagError::ModelMismatch { .. }
        ));
        assert_eq!(index.len().await, 0);
    }

    #[tokio::test]
    async fn query_rejects_wrong_model() {
        let index = VectorIndex::new();
        index
            .upsert(embedding("p1", vec![1.0, 0.0]), snapshot("d1", 0, "life"))
            .await
            .unwrap();

        let err = index
            .query(&[1.0, 0.0], "embed-v2", 1, None)
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::ModelMismatch { .. }));
    }

    #[tokio::test]
    async fn filter_applies_before_truncation() {
        let index = VectorIndex::new();
        // Three "life" passages score higher than the single "home" one.
        index
            .upsert(embedding("p1", vec![1.0, 0.0]), snapshot("d1", 0, "life"))
            .await
            .unwrap();
        index
            .upsert(embedding("p2", vec![0.9, 0.1]), snapshot("d1", 1, "life"))
            .await
            .unwrap();
        index
            .upsert(embedding("p3", vec![0.8, 0.2]), snapshot("d1", 2, "life"))
            .await
            .unwrap();
        index
            .upsert(embedding("p4", vec![0.1, 0.9]), snapshot("d2", 0, "home"))
            .await
            .unwrap();

        let filter = MetadataFilter {
            field: FilterField::ProductCategory,
            op: FilterOp::Equals,
            value: "home".to_string(),
        };
        let results = index
            .query(&[1.0, 0.0], "embed-v1", 1, Some(&filter))
            .await
            .unwrap();
        // Filtered before truncation: the home passage is found even though
        // it would never make an unfiltered top-1.
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].passage_id, "p4");
    }

    #[tokio::test]
    async fn rebuild_leaves_query_results_unchanged() {
        let index = VectorIndex::new();
        index
            .upsert(embedding("p1", vec![1.0, 0.0]), snapshot("d1", 0, "life"))
            .await
            .unwrap();
        index
            .upsert(embedding("p2", vec![0.6, 0.8]), snapshot("d1", 1, "life"))
            .await
            .unwrap();
        index
            .upsert(embedding("p3", vec![0.0, 1.0]), snapshot("d2", 0, "home"))
            .await
            .unwrap();
        index.delete("p2").await;

        let before = index.query(&[0.9, 0.1], "embed-v1", 3, None).await.unwrap();
        index.rebuild().await;
        let after = index.query(&[0.9, 0.1], "embed-v1", 3, None).await.unwrap();

        assert_eq!(before.len(), after.len());
        for (b, a) in before.iter().zip(after.iter()) {
            assert_eq!(b.passage_id, a.passage_id);
            assert_eq!(b.score, a.score);
            assert_eq!(b.rank, a.rank);
        }
        assert_eq!(index.snapshots(&["p3".into()]).await.len(), 1);
    }

    #[tokio::test]
    async fn upsert_replaces_and_delete_removes() {
        let index = VectorIndex::new();
        index
            .upsert(embedding("p1", vec![1.0, 0.0]), snapshot("d1", 0, "life"))
            .await
            .unwrap();
        index
            .upsert(embedding("p1", vec![0.0, 1.0]), snapshot("d1", 0, "life"))
            .await
            .unwrap();
        assert_eq!(index.len().await, 1);

        let results = index.query(&[0.0, 1.0], "embed-v1", 1, None).await.unwrap();
        assert!(results[0].score > 0.99);

        assert!(index.delete("p1").await);
        assert!(!index.delete("p1").await);
        assert!(index.is_empty().await);
    }
}
