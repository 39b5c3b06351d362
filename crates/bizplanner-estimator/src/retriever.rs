//! Business-isolated similarity retrieval.
//!
//! [`IsolatedRetriever::find_similar`] always takes a context id, asks the
//! index for that context only, and then re-checks every raw hit. A hit
//! from another context is an [`EstimatorError::IsolationBreach`]: logged
//! at `error!` with full detail and returned, never filtered away.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::Arc;

use bizplanner_store::{ContextId, ItemId, VectorIndex};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, instrument};

use crate::error::{EstimatorError, Result};

/// A completed item similar to the query, scoped to the queried context.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Neighbor {
    pub item_id: ItemId,
    /// Cosine similarity clamped to `[0, 1]`.
    pub similarity: f32,
    pub actual_minutes: u32,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Retriever bound to a fixed set of isolation contexts.
#[derive(Clone)]
pub struct IsolatedRetriever {
    index: Arc<dyn VectorIndex>,
    contexts: BTreeSet<ContextId>,
}

impl IsolatedRetriever {
    pub fn new(index: Arc<dyn VectorIndex>, contexts: impl IntoIterator<Item = ContextId>) -> Self {
        Self {
            index,
            contexts: contexts.into_iter().collect(),
        }
    }

    pub fn knows(&self, context_id: ContextId) -> bool {
        self.contexts.contains(&context_id)
    }

    /// Up to `k` neighbours of `embedding` in `context_id` with similarity
    /// at least `min_similarity`, most similar first. Equal similarity
    /// prefers the more recently completed item, then the smaller id.
    #[instrument(skip(self, embedding), fields(dim = embedding.len()))]
    pub async fn find_similar(
        &self,
        embedding: &[f32],
        context_id: ContextId,
        k: usize,
        min_similarity: f32,
    ) -> Result<Vec<Neighbor>> {
        if !self.knows(context_id) {
            return Err(EstimatorError::UnknownContext(context_id));
        }
        if embedding.is_empty() {
            return Err(EstimatorError::InvalidArgument(
                "query embedding is empty".into(),
            ));
        }
        if !(0.0..=1.0).contains(&min_similarity) {
            return Err(EstimatorError::InvalidArgument(format!(
                "min_similarity must be within [0, 1], got {min_similarity}"
            )));
        }
        if k == 0 {
            return Ok(Vec::new());
        }

        let hits = self.index.nearest(embedding, context_id, k).await?;

        if let Some(stray) = hits.iter().find(|h| h.context_id != context_id) {
            error!(
                expected_context = %context_id,
                found_context = %stray.context_id,
                item_id = stray.item_id,
                similarity = stray.similarity,
                "isolation breach: index returned an item from another context"
            );
            return Err(EstimatorError::IsolationBreach {
                expected: context_id,
                found: stray.context_id,
                item_id: stray.item_id,
            });
        }

        let raw = hits.len();
        let mut neighbors: Vec<Neighbor> = hits
            .into_iter()
            .filter(|h| h.similarity >= min_similarity)
            .map(|h| Neighbor {
                item_id: h.item_id,
                similarity: h.similarity.clamp(0.0, 1.0),
                actual_minutes: h.actual_minutes,
                completed_at: h.completed_at,
            })
            .collect();
        neighbors.sort_by(neighbor_order);
        neighbors.truncate(k);

        debug!(
            context_id = %context_id,
            raw,
            kept = neighbors.len(),
            "similar items retrieved"
        );
        Ok(neighbors)
    }
}

fn neighbor_order(a: &Neighbor, b: &Neighbor) -> Ordering {
    b.similarity
        .partial_cmp(&a.similarity)
        .unwrap_or(Ordering::Equal)
        .then_with(|| b.completed_at.cmp(&a.completed_at))
        .then_with(|| a.item_id.cmp(&b.item_id))
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use bizplanner_store::{IndexEntry, IndexHit, MemoryVectorIndex, StoreResult};

    use super::*;

    /// An index that ignores the context filter.
    struct LeakyIndex(Vec<IndexHit>);

    #[async_trait]
    impl VectorIndex for LeakyIndex {
        async fn nearest(
            &self,
            _query: &[f32],
            _context_id: ContextId,
            _k: usize,
        ) -> StoreResult<Vec<IndexHit>> {
            Ok(self.0.clone())
        }
    }

    fn entry(id: ItemId, ctx: i64, embedding: Vec<f32>) -> IndexEntry {
        IndexEntry {
            item_id: id,
            context_id: ContextId(ctx),
            embedding,
            actual_minutes: 30,
            completed_at: DateTime::from_timestamp_millis(id * 1_000),
        }
    }

    #[tokio::test]
    async fn breach_is_raised_not_filtered() {
        let leaky = LeakyIndex(vec![
            IndexHit {
                item_id: 1,
                context_id: ContextId(1),
                similarity: 0.99,
                actual_minutes: 10,
                completed_at: None,
            },
            IndexHit {
                item_id: 2,
                context_id: ContextId(2),
                similarity: 0.98,
                actual_minutes: 500,
                completed_at: None,
            },
        ]);
        let retriever = IsolatedRetriever::new(Arc::new(leaky), [ContextId(1), ContextId(2)]);

        let err = retriever
            .find_similar(&[1.0], ContextId(1), 5, 0.7)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EstimatorError::IsolationBreach {
                expected: ContextId(1),
                found: ContextId(2),
                item_id: 2
            }
        ));
    }

    #[tokio::test]
    async fn below_threshold_is_excluded() {
        let index = MemoryVectorIndex::new();
        index.upsert(entry(1, 1, vec![1.0, 0.0]));
        index.upsert(entry(2, 1, vec![0.0, 1.0]));
        let retriever = IsolatedRetriever::new(Arc::new(index), [ContextId(1)]);

        let found = retriever
            .find_similar(&[1.0, 0.0], ContextId(1), 5, 0.7)
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].item_id, 1);
    }

    #[tokio::test]
    async fn unknown_context_is_rejected() {
        let retriever = IsolatedRetriever::new(Arc::new(MemoryVectorIndex::new()), [ContextId(1)]);
        let err = retriever
            .find_similar(&[1.0], ContextId(9), 5, 0.7)
            .await
            .unwrap_err();
        assert!(matches!(err, EstimatorError::UnknownContext(ContextId(9))));
    }

    #[tokio::test]
    async fn bad_threshold_is_rejected() {
        let retriever = IsolatedRetriever::new(Arc::new(MemoryVectorIndex::new()), [ContextId(1)]);
        let err = retriever
            .find_similar(&[1.0], ContextId(1), 5, 1.5)
            .await
            .unwrap_err();
        assert!(matches!(err, EstimatorError::InvalidArgument(_)));
    }
}
