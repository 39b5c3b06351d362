//! # bizplanner-store
//!
//! Storage engine for bizplanner.
//!
//! One SQLite database (WAL mode) holds every work item together with its
//! lifecycle fields and its durable embedding. The same table backs the
//! context-scoped vector index used for duration estimation.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │  WorkItemStore      (CRUD + lifecycle)   │
//! │  SqliteVectorIndex  (cosine, per context)│
//! ├─────────────────────────────────────────┤
//! │  Database (rusqlite WAL, blocking pool)  │
//! │  Migrations (versioned, transactional)   │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Quick start
//!
//! ```ignore
//! use bizplanner_store::{ContextId, Database, NewWorkItem, WorkItemStore};
//!
//! let db = Database::open_and_migrate("data/bizplanner.db").await?;
//! let items = WorkItemStore::new(db.clone());
//! let item = items.create(NewWorkItem::new(ContextId(1), "Prepare tender docs")).await?;
//! items.complete(item.id, 95).await?;
//! ```

pub mod db;
pub mod error;
pub mod migration;
pub mod vector;
pub mod work_item;

// ── re-exports ───────────────────────────────────────────────────────

pub use db::Database;
pub use error::{StoreError, StoreResult};
pub use vector::{
    IndexEntry, IndexHit, MemoryVectorIndex, SqliteVectorIndex, VectorIndex, cosine_similarity,
    rank_order,
};
pub use work_item::{
    ContextId, ItemId, MAX_MINUTES, MIN_MINUTES, NewWorkItem, StatusCount, WorkItem,
    WorkItemStatus, WorkItemStore, WorkItemUpdate,
};
