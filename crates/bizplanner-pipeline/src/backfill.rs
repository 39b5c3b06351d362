//! Operator-driven re-embedding of items whose detached backfill failed.

use std::sync::Arc;

use bizplanner_adapters::EmbeddingGenerator;
use bizplanner_store::{ItemId, WorkItemStore};
use tracing::{info, instrument, warn};

use crate::create::embed_checked;
use crate::error::Result;

/// Outcome of one backfill pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackfillReport {
    pub embedded: Vec<ItemId>,
    pub failed: Vec<(ItemId, String)>,
}

/// Writes missing embeddings, least-failed and then oldest items first.
#[derive(Clone)]
pub struct BackfillService {
    store: WorkItemStore,
    embedder: Arc<dyn EmbeddingGenerator>,
    dimension: usize,
}

impl BackfillService {
    pub fn new(store: WorkItemStore, embedder: Arc<dyn EmbeddingGenerator>, dimension: usize) -> Self {
        Self {
            store,
            embedder,
            dimension,
        }
    }

    /// Embed up to `limit` items that have no embedding yet.
    ///
    /// A failure on one item is counted against it and the pass continues,
    /// so items that keep failing drop behind newer ones. Only store errors
    /// while listing abort the pass.
    #[instrument(skip(self))]
    pub async fn run_once(&self, limit: u32) -> Result<BackfillReport> {
        let pending = self.store.list_missing_embeddings(limit).await?;
        let mut report = BackfillReport::default();

        for item in pending {
            let result = match embed_checked(self.embedder.as_ref(), &item.title, self.dimension).await {
                Ok(embedding) => self
                    .store
                    .update_embedding(item.id, embedding)
                    .await
                    .map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };
            match result {
                Ok(()) => report.embedded.push(item.id),
                Err(reason) => {
                    match self.store.record_embedding_failure(item.id).await {
                        Ok(attempts) => {
                            warn!(item_id = item.id, attempts, %reason, "backfill failed")
                        }
                        Err(e) => warn!(
                            item_id = item.id,
                            %reason,
                            error = %e,
                            "backfill failed and the attempt was not recorded"
                        ),
                    }
                    report.failed.push((item.id, reason));
                }
            }
        }

        info!(
            embedded = report.embedded.len(),
            failed = report.failed.len(),
            "backfill pass finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use bizplanner_adapters::AdapterError;
    use bizplanner_store::{ContextId, Database, NewWorkItem};

    use super::*;

    /// Embeds by title length; titles containing "fail" are rejected.
    struct LengthEmbedder {
        dimension: usize,
    }

    #[async_trait]
    impl EmbeddingGenerator for LengthEmbedder {
        async fn embed(&self, text: &str) -> bizplanner_adapters::Result<Vec<f32>> {
            if text.contains("fail") {
                return Err(AdapterError::Embedding {
                    reason: "rejected".into(),
                    transient: false,
                });
            }
            Ok(vec![text.len() as f32; self.dimension])
        }
    }

    #[tokio::test]
    async fn fills_missing_embeddings_and_reports_failures() {
        let db = Database::open_in_memory_and_migrate().await.unwrap();
        let store = WorkItemStore::new(db);
        let ok = store
            .create(NewWorkItem::new(ContextId(1), "Order parts"))
            .await
            .unwrap();
        let bad = store
            .create(NewWorkItem::new(ContextId(1), "this will fail"))
            .await
            .unwrap();

        let service = BackfillService::new(store.clone(), Arc::new(LengthEmbedder { dimension: 3 }), 3);
        let report = service.run_once(10).await.unwrap();

        assert_eq!(report.embedded, vec![ok.id]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, bad.id);
        assert!(store.get(ok.id).await.unwrap().has_embedding());

        let again = service.run_once(10).await.unwrap();
        assert!(again.embedded.is_empty());
        assert_eq!(again.failed.len(), 1);
    }

    #[tokio::test]
    async fn failing_item_does_not_block_newer_items() {
        let db = Database::open_in_memory_and_migrate().await.unwrap();
        let store = WorkItemStore::new(db);
        let bad = store
            .create(NewWorkItem::new(ContextId(1), "this will fail"))
            .await
            .unwrap();
        let good = store
            .create(NewWorkItem::new(ContextId(1), "Order parts"))
            .await
            .unwrap();

        let service = BackfillService::new(store.clone(), Arc::new(LengthEmbedder { dimension: 3 }), 3);
        let first = service.run_once(1).await.unwrap();
        assert_eq!(first.failed.len(), 1);
        assert_eq!(first.failed[0].0, bad.id);

        let second = service.run_once(1).await.unwrap();
        assert_eq!(second.embedded, vec![good.id]);
        assert!(store.get(good.id).await.unwrap().has_embedding());

        // Only the bad item is left; it is still retried.
        let third = service.run_once(1).await.unwrap();
        assert_eq!(third.failed[0].0, bad.id);
    }

    #[tokio::test]
    async fn wrong_dimension_is_not_written() {
        let db = Database::open_in_memory_and_migrate().await.unwrap();
        let store = WorkItemStore::new(db);
        let item = store
            .create(NewWorkItem::new(ContextId(1), "Order parts"))
            .await
            .unwrap();

        let service = BackfillService::new(store.clone(), Arc::new(LengthEmbedder { dimension: 2 }), 3);
        let report = service.run_once(10).await.unwrap();

        assert_eq!(report.failed.len(), 1);
        assert!(report.failed[0].1.contains("dimensions"));
        assert!(!store.get(item.id).await.unwrap().has_embedding());
    }
}
