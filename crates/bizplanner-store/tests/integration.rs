//! Integration tests for the bizplanner-store crate.
//!
//! These run against an on-disk SQLite database (via tempfile) and cover
//! the lifecycle races and the vector index over real rows.

use bizplanner_store::{
    ContextId, Database, NewWorkItem, SqliteVectorIndex, StoreError, VectorIndex, WorkItemStatus,
    WorkItemStore,
};

async fn on_disk() -> (tempfile::TempDir, Database) {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open_and_migrate(dir.path().join("planner.db"))
        .await
        .unwrap();
    (dir, db)
}

/// Create a completed item with an embedding in `ctx`.
async fn seed_done(
    store: &WorkItemStore,
    ctx: i64,
    title: &str,
    embedding: Vec<f32>,
    minutes: u32,
) -> i64 {
    let mut input = NewWorkItem::new(ContextId(ctx), title);
    input.embedding = Some(embedding);
    let item = store.create(input).await.unwrap();
    store.complete(item.id, minutes).await.unwrap();
    item.id
}

// ═══════════════════════════════════════════════════════════════════════
//  Database lifecycle
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn items_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("planner.db");

    let id = {
        let db = Database::open_and_migrate(path.clone()).await.unwrap();
        let store = WorkItemStore::new(db);
        store
            .create(NewWorkItem::new(ContextId(4), "Order samples"))
            .await
            .unwrap()
            .id
    };

    let db = Database::open_and_migrate(path).await.unwrap();
    let item = WorkItemStore::new(db).get(id).await.unwrap();
    assert_eq!(item.title, "Order samples");
    assert_eq!(item.context_id, ContextId(4));
}

// ═══════════════════════════════════════════════════════════════════════
//  Lifecycle races
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_completion_has_one_winner() {
    let (_dir, db) = on_disk().await;
    let store = WorkItemStore::new(db);
    let item = store
        .create(NewWorkItem::new(ContextId(1), "Assemble prototype"))
        .await
        .unwrap();

    let a = {
        let store = store.clone();
        tokio::spawn(async move { store.complete(item.id, 60).await })
    };
    let b = {
        let store = store.clone();
        tokio::spawn(async move { store.complete(item.id, 90).await })
    };
    let results = [a.await.unwrap(), b.await.unwrap()];

    let winners: Vec<u32> = results
        .iter()
        .filter_map(|r| r.as_ref().ok())
        .filter_map(|item| item.actual_minutes)
        .collect();
    assert_eq!(winners.len(), 1);
    assert!(
        results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, StoreError::InvalidTransition { .. }))
    );

    let stored = store.get(item.id).await.unwrap();
    assert_eq!(stored.status, WorkItemStatus::Done);
    assert_eq!(stored.actual_minutes, Some(winners[0]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn complete_and_archive_race_stays_legal() {
    let (_dir, db) = on_disk().await;
    let store = WorkItemStore::new(db);
    let item = store
        .create(NewWorkItem::new(ContextId(1), "x"))
        .await
        .unwrap();

    let a = {
        let store = store.clone();
        tokio::spawn(async move { store.complete(item.id, 15).await })
    };
    let b = {
        let store = store.clone();
        tokio::spawn(async move { store.archive(item.id).await })
    };
    let (a, b) = (a.await.unwrap(), b.await.unwrap());
    assert!(b.is_ok());

    let stored = store.get(item.id).await.unwrap();
    assert_eq!(stored.status, WorkItemStatus::Archived);
    // Either completion landed first (then archived) or it was rejected.
    match a {
        Ok(_) => assert_eq!(stored.actual_minutes, Some(15)),
        Err(e) => {
            assert!(matches!(e, StoreError::InvalidTransition { .. }));
            assert_eq!(stored.actual_minutes, None);
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Vector index
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn vector_roundtrip_returns_same_item() {
    let (_dir, db) = on_disk().await;
    let store = WorkItemStore::new(db.clone());
    let index = SqliteVectorIndex::new(db);

    let v = vec![0.3, -0.2, 0.9, 0.1];
    let id = seed_done(&store, 2, "Write test report", v.clone(), 75).await;

    let hits = index.nearest(&v, ContextId(2), 1).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].item_id, id);
    assert!((hits[0].similarity - 1.0).abs() < 1e-5);
    assert_eq!(hits[0].actual_minutes, 75);
}

#[tokio::test]
async fn vector_index_never_crosses_contexts() {
    let (_dir, db) = on_disk().await;
    let store = WorkItemStore::new(db.clone());
    let index = SqliteVectorIndex::new(db);

    seed_done(&store, 1, "Prepare invoice", vec![1.0, 0.0, 0.0], 30).await;
    seed_done(&store, 2, "Prepare invoice", vec![1.0, 0.0, 0.0], 300).await;
    seed_done(&store, 2, "Prepare invoices", vec![0.99, 0.01, 0.0], 280).await;

    let hits = index.nearest(&[1.0, 0.0, 0.0], ContextId(1), 5).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert!(hits.iter().all(|h| h.context_id == ContextId(1)));
    assert_eq!(hits[0].actual_minutes, 30);
}

#[tokio::test]
async fn open_and_unembedded_items_are_not_neighbours() {
    let (_dir, db) = on_disk().await;
    let store = WorkItemStore::new(db.clone());
    let index = SqliteVectorIndex::new(db);

    let mut open = NewWorkItem::new(ContextId(1), "still open");
    open.embedding = Some(vec![1.0, 0.0]);
    store.create(open).await.unwrap();

    let bare = store
        .create(NewWorkItem::new(ContextId(1), "no embedding"))
        .await
        .unwrap();
    store.complete(bare.id, 20).await.unwrap();

    assert!(
        index
            .nearest(&[1.0, 0.0], ContextId(1), 5)
            .await
            .unwrap()
            .is_empty()
    );

    // Backfilling the embedding makes the completed item eligible.
    store.update_embedding(bare.id, vec![1.0, 0.0]).await.unwrap();
    let hits = index.nearest(&[1.0, 0.0], ContextId(1), 5).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].item_id, bare.id);
}

#[tokio::test]
async fn archived_items_remain_neighbours() {
    let (_dir, db) = on_disk().await;
    let store = WorkItemStore::new(db.clone());
    let index = SqliteVectorIndex::new(db);

    let id = seed_done(&store, 3, "Lab calibration", vec![0.0, 1.0], 120).await;
    store.archive(id).await.unwrap();

    let hits = index.nearest(&[0.0, 1.0], ContextId(3), 5).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].item_id, id);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn retrieval_proceeds_while_a_write_holds_the_connection() {
    let (_dir, db) = on_disk().await;
    let store = WorkItemStore::new(db.clone());
    let index = SqliteVectorIndex::new(db.clone());
    let done = seed_done(&store, 1, "Ship samples", vec![1.0, 0.0], 40).await;

    let (held_tx, held_rx) = tokio::sync::oneshot::channel();
    let writer = {
        let db = db.clone();
        tokio::spawn(async move {
            db.execute(move |_conn| {
                let _ = held_tx.send(());
                std::thread::sleep(std::time::Duration::from_millis(500));
                Ok(())
            })
            .await
        })
    };
    held_rx.await.unwrap();

    let hits = tokio::time::timeout(
        std::time::Duration::from_millis(300),
        index.nearest(&[1.0, 0.0], ContextId(1), 1),
    )
    .await
    .expect("retrieval waited for the writer")
    .unwrap();
    assert_eq!(hits[0].item_id, done);

    writer.await.unwrap().unwrap();
}
