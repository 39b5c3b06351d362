//! Lifecycle changes requested after creation.

use bizplanner_store::{ItemId, MAX_MINUTES, MIN_MINUTES, WorkItem, WorkItemStore};
use tracing::{info, instrument};

use crate::error::{PipelineError, Result};

/// Applies `open -> done` and the archive transitions.
///
/// Both go through the store's conditional update, so concurrent callers
/// racing on one item get exactly one success.
#[derive(Clone)]
pub struct FeedbackRecorder {
    store: WorkItemStore,
}

impl FeedbackRecorder {
    pub fn new(store: WorkItemStore) -> Self {
        Self { store }
    }

    /// `CompleteWorkItem(item_id, actual_minutes) -> item`.
    ///
    /// Once done, the item becomes a neighbour for future estimates in its
    /// context (as soon as its embedding is backfilled).
    #[instrument(skip(self))]
    pub async fn record_completion(&self, item_id: ItemId, actual_minutes: u32) -> Result<WorkItem> {
        if !(MIN_MINUTES..=MAX_MINUTES).contains(&actual_minutes) {
            return Err(PipelineError::Validation(format!(
                "actual duration must be between {MIN_MINUTES} and {MAX_MINUTES} minutes, got {actual_minutes}"
            )));
        }

        let item = self.store.complete(item_id, actual_minutes).await?;
        match item.estimation_accuracy() {
            Some(accuracy) => info!(
                item_id,
                context_id = %item.context_id,
                estimated_minutes = item.estimated_minutes,
                actual_minutes,
                accuracy = format_args!("{:.2}", accuracy),
                "work item completed"
            ),
            None => info!(item_id, context_id = %item.context_id, actual_minutes, "work item completed"),
        }
        Ok(item)
    }

    /// `ArchiveWorkItem(item_id) -> item`, from `open` or `done`.
    #[instrument(skip(self))]
    pub async fn archive(&self, item_id: ItemId) -> Result<WorkItem> {
        let item = self.store.archive(item_id).await?;
        info!(item_id, context_id = %item.context_id, "work item archived");
        Ok(item)
    }
}

#[cfg(test)]
mod tests {
    use bizplanner_engine::ErrorKind;
    use bizplanner_store::{ContextId, Database, NewWorkItem, StoreError, WorkItemStatus};

    use super::*;

    async fn recorder() -> (FeedbackRecorder, WorkItemStore) {
        let db = Database::open_in_memory_and_migrate().await.unwrap();
        let store = WorkItemStore::new(db);
        (FeedbackRecorder::new(store.clone()), store)
    }

    #[tokio::test]
    async fn completion_is_applied_once() {
        let (recorder, store) = recorder().await;
        let mut input = NewWorkItem::new(ContextId(1), "Prepare quote");
        input.estimated_minutes = Some(40);
        let item = store.create(input).await.unwrap();

        let done = recorder.record_completion(item.id, 50).await.unwrap();
        assert_eq!(done.status, WorkItemStatus::Done);
        assert!((done.estimation_accuracy().unwrap() - 0.8).abs() < 1e-9);

        let err = recorder.record_completion(item.id, 90).await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Store(StoreError::InvalidTransition { .. })
        ));
        assert_eq!(err.kind(), ErrorKind::InvalidTransition);
        assert_eq!(store.get(item.id).await.unwrap().actual_minutes, Some(50));
    }

    #[tokio::test]
    async fn out_of_range_duration_is_a_validation_error() {
        let (recorder, store) = recorder().await;
        let item = store
            .create(NewWorkItem::new(ContextId(1), "x"))
            .await
            .unwrap();

        for minutes in [0, 481] {
            let err = recorder.record_completion(item.id, minutes).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Validation);
        }
        assert_eq!(store.get(item.id).await.unwrap().status, WorkItemStatus::Open);
    }

    #[tokio::test]
    async fn archive_is_terminal() {
        let (recorder, store) = recorder().await;
        let item = store
            .create(NewWorkItem::new(ContextId(2), "Old idea"))
            .await
            .unwrap();

        let archived = recorder.archive(item.id).await.unwrap();
        assert_eq!(archived.status, WorkItemStatus::Archived);

        assert_eq!(
            recorder.archive(item.id).await.unwrap_err().kind(),
            ErrorKind::InvalidTransition
        );
        assert_eq!(
            recorder.record_completion(item.id, 30).await.unwrap_err().kind(),
            ErrorKind::InvalidTransition
        );
    }

    #[tokio::test]
    async fn unknown_item_is_not_found() {
        let (recorder, _) = recorder().await;
        assert_eq!(
            recorder.record_completion(999, 30).await.unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }
}
