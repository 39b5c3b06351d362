//! Work item persistence and lifecycle.
//!
//! A work item is created once, in `open` status, and then moves through
//! `open -> done`, `open -> archived` or `done -> archived`. Lifecycle
//! writes are optimistic: the current status is read, and the `UPDATE` is
//! conditioned on that status still holding. When two writers race, the
//! second one matches zero rows and gets [`StoreError::InvalidTransition`].

use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::db::Database;
use crate::error::{StoreError, StoreResult};
use crate::vector::{blob_to_embedding, embedding_to_blob};

/// Smallest duration, in minutes, accepted for estimates and actuals.
pub const MIN_MINUTES: u32 = 1;
/// Largest duration, in minutes, accepted for estimates and actuals.
pub const MAX_MINUTES: u32 = 480;

/// Storage format for parsed deadlines.
const DEADLINE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

const SELECT_COLUMNS: &str = "id, context_id, title, status, priority, estimated_minutes, \
     actual_minutes, embedding, deadline, deadline_text, assignee_name, project, requester_id, \
     created_at, completed_at";

// ═══════════════════════════════════════════════════════════════════════
//  Types
// ═══════════════════════════════════════════════════════════════════════

/// Row id of a work item.
pub type ItemId = i64;

/// Identifier of an isolation context (one business).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextId(pub i64);

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkItemStatus {
    Open,
    Done,
    Archived,
}

impl WorkItemStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Done => "done",
            Self::Archived => "archived",
        }
    }

    pub fn from_str(s: &str) -> StoreResult<Self> {
        match s {
            "open" => Ok(Self::Open),
            "done" => Ok(Self::Done),
            "archived" => Ok(Self::Archived),
            other => Err(StoreError::InvalidArgument(format!(
                "unknown work item status: {other}"
            ))),
        }
    }

    /// Whether `self -> next` is a legal lifecycle transition.
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Open, Self::Done) | (Self::Open, Self::Archived) | (Self::Done, Self::Archived)
        )
    }
}

impl fmt::Display for WorkItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted work item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: ItemId,
    pub context_id: ContextId,
    pub title: String,
    pub status: WorkItemStatus,
    /// 1 = do now, 2 = schedule, 3 = delegate, 4 = backlog.
    pub priority: u8,
    pub estimated_minutes: Option<u32>,
    pub actual_minutes: Option<u32>,
    #[serde(skip)]
    pub embedding: Option<Vec<f32>>,
    pub deadline: Option<NaiveDateTime>,
    /// Deadline as the requester phrased it, kept when it could not be parsed.
    pub deadline_text: Option<String>,
    pub assignee_name: Option<String>,
    pub project: Option<String>,
    pub requester_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkItem {
    /// `1 - |estimated - actual| / actual`, clamped to `[0, 1]`.
    ///
    /// `None` unless both durations are known.
    pub fn estimation_accuracy(&self) -> Option<f64> {
        let estimated = f64::from(self.estimated_minutes?);
        let actual = f64::from(self.actual_minutes?);
        if actual <= 0.0 {
            return None;
        }
        Some((1.0 - (estimated - actual).abs() / actual).clamp(0.0, 1.0))
    }

    pub fn has_embedding(&self) -> bool {
        self.embedding.is_some()
    }
}

/// Input for creating a work item.
#[derive(Debug, Clone)]
pub struct NewWorkItem {
    pub context_id: ContextId,
    pub title: String,
    pub priority: u8,
    pub estimated_minutes: Option<u32>,
    pub embedding: Option<Vec<f32>>,
    pub deadline: Option<NaiveDateTime>,
    pub deadline_text: Option<String>,
    pub assignee_name: Option<String>,
    pub project: Option<String>,
    pub requester_id: Option<String>,
}

impl NewWorkItem {
    /// Minimal item: a title in a context, default priority.
    pub fn new(context_id: ContextId, title: impl Into<String>) -> Self {
        Self {
            context_id,
            title: title.into(),
            priority: 2,
            estimated_minutes: None,
            embedding: None,
            deadline: None,
            deadline_text: None,
            assignee_name: None,
            project: None,
            requester_id: None,
        }
    }
}

/// Descriptive fields that may be changed after creation.
///
/// `context_id` and lifecycle fields are deliberately absent.
#[derive(Debug, Clone, Default)]
pub struct WorkItemUpdate {
    pub title: Option<String>,
    pub priority: Option<u8>,
    pub estimated_minutes: Option<u32>,
    pub deadline: Option<NaiveDateTime>,
    pub assignee_name: Option<String>,
    pub project: Option<String>,
}

/// Per-context tally used by `bizplanner status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusCount {
    pub context_id: ContextId,
    pub status: WorkItemStatus,
    pub count: i64,
}

// ═══════════════════════════════════════════════════════════════════════
//  Row mapping
// ═══════════════════════════════════════════════════════════════════════

struct WorkItemRow {
    id: i64,
    context_id: i64,
    title: String,
    status: String,
    priority: i64,
    estimated_minutes: Option<i64>,
    actual_minutes: Option<i64>,
    embedding: Option<Vec<u8>>,
    deadline: Option<String>,
    deadline_text: Option<String>,
    assignee_name: Option<String>,
    project: Option<String>,
    requester_id: Option<String>,
    created_at: i64,
    completed_at: Option<i64>,
}

impl WorkItemRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            context_id: row.get(1)?,
            title: row.get(2)?,
            status: row.get(3)?,
            priority: row.get(4)?,
            estimated_minutes: row.get(5)?,
            actual_minutes: row.get(6)?,
            embedding: row.get(7)?,
            deadline: row.get(8)?,
            deadline_text: row.get(9)?,
            assignee_name: row.get(10)?,
            project: row.get(11)?,
            requester_id: row.get(12)?,
            created_at: row.get(13)?,
            completed_at: row.get(14)?,
        })
    }

    fn into_work_item(self) -> StoreResult<WorkItem> {
        let deadline = self
            .deadline
            .map(|text| {
                NaiveDateTime::parse_from_str(&text, DEADLINE_FORMAT).map_err(|e| {
                    StoreError::InvalidArgument(format!("stored deadline {text:?} is malformed: {e}"))
                })
            })
            .transpose()?;

        Ok(WorkItem {
            id: self.id,
            context_id: ContextId(self.context_id),
            title: self.title,
            status: WorkItemStatus::from_str(&self.status)?,
            priority: narrow(self.priority, "priority")?,
            estimated_minutes: self
                .estimated_minutes
                .map(|m| narrow(m, "estimated_minutes"))
                .transpose()?,
            actual_minutes: self
                .actual_minutes
                .map(|m| narrow(m, "actual_minutes"))
                .transpose()?,
            embedding: self.embedding.map(blob_to_embedding),
            deadline,
            deadline_text: self.deadline_text,
            assignee_name: self.assignee_name,
            project: self.project,
            requester_id: self.requester_id,
            created_at: millis_to_datetime(self.created_at)?,
            completed_at: self.completed_at.map(millis_to_datetime).transpose()?,
        })
    }
}

fn narrow<T: TryFrom<i64>>(value: i64, column: &str) -> StoreResult<T> {
    T::try_from(value)
        .map_err(|_| StoreError::InvalidArgument(format!("{column} out of range: {value}")))
}

fn millis_to_datetime(ms: i64) -> StoreResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::InvalidArgument(format!("timestamp out of range: {ms}")))
}

fn check_minutes(minutes: u32, what: &str) -> StoreResult<()> {
    if (MIN_MINUTES..=MAX_MINUTES).contains(&minutes) {
        Ok(())
    } else {
        Err(StoreError::InvalidArgument(format!(
            "{what} must be between {MIN_MINUTES} and {MAX_MINUTES} minutes, got {minutes}"
        )))
    }
}

/// Load one item inside an already-held connection.
fn load(conn: &Connection, id: ItemId) -> StoreResult<WorkItem> {
    let sql = format!("SELECT {SELECT_COLUMNS} FROM work_items WHERE id = ?1");
    let row = conn
        .query_row(&sql, [id], WorkItemRow::from_row)
        .optional()?;
    match row {
        Some(row) => row.into_work_item(),
        None => Err(StoreError::NotFound {
            entity: "work item",
            id: id.to_string(),
        }),
    }
}

fn query_items(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> StoreResult<Vec<WorkItem>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, WorkItemRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(WorkItemRow::into_work_item).collect()
}

/// Apply a conditional lifecycle update.
///
/// Reads the current status, rejects illegal transitions up front, then
/// issues an `UPDATE` guarded by the status that was read. Zero affected
/// rows means another writer got there first.
fn transition(
    conn: &Connection,
    id: ItemId,
    to: WorkItemStatus,
    apply: impl FnOnce(&Connection, WorkItemStatus) -> rusqlite::Result<usize>,
) -> StoreResult<WorkItem> {
    let current = load(conn, id)?.status;
    if !current.can_transition_to(to) {
        return Err(StoreError::InvalidTransition {
            id,
            from: current.as_str(),
            to: to.as_str(),
        });
    }

    let changed = apply(conn, current)?;
    if changed == 0 {
        let now = load(conn, id)?.status;
        return Err(StoreError::InvalidTransition {
            id,
            from: now.as_str(),
            to: to.as_str(),
        });
    }

    load(conn, id)
}

// ═══════════════════════════════════════════════════════════════════════
//  WorkItemStore
// ═══════════════════════════════════════════════════════════════════════

/// CRUD and lifecycle operations on the `work_items` table.
#[derive(Clone)]
pub struct WorkItemStore {
    db: Database,
}

impl WorkItemStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert a new `open` item in a single statement and return it.
    #[instrument(skip(self, input), fields(context_id = %input.context_id))]
    pub async fn create(&self, input: NewWorkItem) -> StoreResult<WorkItem> {
        if input.title.trim().is_empty() {
            return Err(StoreError::InvalidArgument("title must not be empty".into()));
        }
        if !(1..=4).contains(&input.priority) {
            return Err(StoreError::InvalidArgument(format!(
                "priority must be between 1 and 4, got {}",
                input.priority
            )));
        }
        if let Some(minutes) = input.estimated_minutes {
            check_minutes(minutes, "estimate")?;
        }

        let now = Utc::now().timestamp_millis();
        let deadline = input
            .deadline
            .map(|d| d.format(DEADLINE_FORMAT).to_string());
        let embedding = input.embedding.map(embedding_to_blob);

        let item = self
            .db
            .execute(move |conn| {
                conn.execute(
                    "INSERT INTO work_items (context_id, title, status, priority, estimated_minutes, \
                     embedding, deadline, deadline_text, assignee_name, project, requester_id, created_at) \
                     VALUES (?1, ?2, 'open', ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                    rusqlite::params![
                        input.context_id.0,
                        input.title.trim(),
                        input.priority,
                        input.estimated_minutes,
                        embedding,
                        deadline,
                        input.deadline_text,
                        input.assignee_name,
                        input.project,
                        input.requester_id,
                        now,
                    ],
                )?;
                load(conn, conn.last_insert_rowid())
            })
            .await?;

        info!(item_id = item.id, context_id = %item.context_id, "work item created");
        Ok(item)
    }

    /// Fetch one item; [`StoreError::NotFound`] when absent.
    #[instrument(skip(self))]
    pub async fn get(&self, id: ItemId) -> StoreResult<WorkItem> {
        self.db.execute(move |conn| load(conn, id)).await
    }

    /// Update descriptive fields. Lifecycle fields go through
    /// [`complete`](Self::complete) and [`archive`](Self::archive).
    #[instrument(skip(self, update))]
    pub async fn update(&self, id: ItemId, update: WorkItemUpdate) -> StoreResult<WorkItem> {
        if let Some(title) = &update.title {
            if title.trim().is_empty() {
                return Err(StoreError::InvalidArgument("title must not be empty".into()));
            }
        }
        if let Some(minutes) = update.estimated_minutes {
            check_minutes(minutes, "estimate")?;
        }
        let deadline = update
            .deadline
            .map(|d| d.format(DEADLINE_FORMAT).to_string());

        self.db
            .execute(move |conn| {
                let changed = conn.execute(
                    "UPDATE work_items SET \
                     title = COALESCE(?2, title), \
                     priority = COALESCE(?3, priority), \
                     estimated_minutes = COALESCE(?4, estimated_minutes), \
                     deadline = COALESCE(?5, deadline), \
                     assignee_name = COALESCE(?6, assignee_name), \
                     project = COALESCE(?7, project) \
                     WHERE id = ?1",
                    rusqlite::params![
                        id,
                        update.title.as_deref().map(str::trim),
                        update.priority,
                        update.estimated_minutes,
                        deadline,
                        update.assignee_name,
                        update.project,
                    ],
                )?;
                if changed == 0 {
                    return Err(StoreError::NotFound {
                        entity: "work item",
                        id: id.to_string(),
                    });
                }
                load(conn, id)
            })
            .await
    }

    /// Store the durable embedding for an item.
    #[instrument(skip(self, embedding), fields(dim = embedding.len()))]
    pub async fn update_embedding(&self, id: ItemId, embedding: Vec<f32>) -> StoreResult<()> {
        if embedding.is_empty() {
            return Err(StoreError::InvalidArgument("embedding must not be empty".into()));
        }
        let blob = embedding_to_blob(embedding);
        self.db
            .execute(move |conn| {
                let changed = conn.execute(
                    "UPDATE work_items SET embedding = ?2 WHERE id = ?1",
                    rusqlite::params![id, blob],
                )?;
                if changed == 0 {
                    return Err(StoreError::NotFound {
                        entity: "work item",
                        id: id.to_string(),
                    });
                }
                Ok(())
            })
            .await?;
        debug!(item_id = id, "embedding stored");
        Ok(())
    }

    /// Count a failed embedding attempt, moving the item behind items that
    /// have failed less often in [`Self::list_missing_embeddings`].
    #[instrument(skip(self))]
    pub async fn record_embedding_failure(&self, id: ItemId) -> StoreResult<u32> {
        self.db
            .execute(move |conn| {
                conn.query_row(
                    "UPDATE work_items SET embedding_attempts = embedding_attempts + 1 \
                     WHERE id = ?1 RETURNING embedding_attempts",
                    [id],
                    |row| row.get(0),
                )
                .optional()?
                .ok_or_else(|| StoreError::NotFound {
                    entity: "work item",
                    id: id.to_string(),
                })
            })
            .await
    }

    /// `open -> done`: record the actual duration and completion time.
    #[instrument(skip(self))]
    pub async fn complete(&self, id: ItemId, actual_minutes: u32) -> StoreResult<WorkItem> {
        check_minutes(actual_minutes, "actual duration")?;
        let now = Utc::now().timestamp_millis();

        self.db
            .execute(move |conn| {
                transition(conn, id, WorkItemStatus::Done, |conn, _| {
                    conn.execute(
                        "UPDATE work_items SET status = 'done', actual_minutes = ?2, completed_at = ?3 \
                         WHERE id = ?1 AND status = 'open'",
                        rusqlite::params![id, actual_minutes, now],
                    )
                })
            })
            .await
    }

    /// `open -> archived` or `done -> archived`.
    #[instrument(skip(self))]
    pub async fn archive(&self, id: ItemId) -> StoreResult<WorkItem> {
        self.db
            .execute(move |conn| {
                transition(conn, id, WorkItemStatus::Archived, |conn, from| {
                    conn.execute(
                        "UPDATE work_items SET status = 'archived' WHERE id = ?1 AND status = ?2",
                        rusqlite::params![id, from.as_str()],
                    )
                })
            })
            .await
    }

    /// Open items of one context, oldest first.
    #[instrument(skip(self))]
    pub async fn list_open_by_context(&self, context_id: ContextId) -> StoreResult<Vec<WorkItem>> {
        self.db
            .execute_read(move |conn| {
                let sql = format!(
                    "SELECT {SELECT_COLUMNS} FROM work_items \
                     WHERE context_id = ?1 AND status = 'open' ORDER BY created_at, id"
                );
                query_items(conn, &sql, [context_id.0])
            })
            .await
    }

    /// Items of one context, optionally filtered by status, newest first.
    #[instrument(skip(self))]
    pub async fn list_by_context(
        &self,
        context_id: ContextId,
        status: Option<WorkItemStatus>,
        limit: u32,
    ) -> StoreResult<Vec<WorkItem>> {
        self.db
            .execute_read(move |conn| {
                let sql = format!(
                    "SELECT {SELECT_COLUMNS} FROM work_items \
                     WHERE context_id = ?1 AND (?2 IS NULL OR status = ?2) \
                     ORDER BY created_at DESC, id DESC LIMIT ?3"
                );
                query_items(
                    conn,
                    &sql,
                    rusqlite::params![context_id.0, status.map(WorkItemStatus::as_str), limit],
                )
            })
            .await
    }

    /// Items of one context completed within `since..=until`.
    #[instrument(skip(self))]
    pub async fn list_completed_between(
        &self,
        context_id: ContextId,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> StoreResult<Vec<WorkItem>> {
        let since = since.timestamp_millis();
        let until = until.timestamp_millis();
        self.db
            .execute_read(move |conn| {
                let sql = format!(
                    "SELECT {SELECT_COLUMNS} FROM work_items \
                     WHERE context_id = ?1 AND status IN ('done','archived') \
                     AND completed_at IS NOT NULL AND completed_at BETWEEN ?2 AND ?3 \
                     ORDER BY completed_at DESC, id"
                );
                query_items(conn, &sql, rusqlite::params![context_id.0, since, until])
            })
            .await
    }

    /// Items whose durable embedding was never written. Items with fewer
    /// failed attempts come first, then the oldest.
    #[instrument(skip(self))]
    pub async fn list_missing_embeddings(&self, limit: u32) -> StoreResult<Vec<WorkItem>> {
        self.db
            .execute_read(move |conn| {
                let sql = format!(
                    "SELECT {SELECT_COLUMNS} FROM work_items \
                     WHERE embedding IS NULL \
                     ORDER BY embedding_attempts, created_at, id LIMIT ?1"
                );
                query_items(conn, &sql, [limit])
            })
            .await
    }

    /// Item counts grouped by context and status.
    #[instrument(skip(self))]
    pub async fn count_by_status(&self) -> StoreResult<Vec<StatusCount>> {
        self.db
            .execute_read(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT context_id, status, count(*) FROM work_items \
                     GROUP BY context_id, status ORDER BY context_id, status",
                )?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, i64>(2)?,
                        ))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;

                rows.into_iter()
                    .map(|(ctx, status, count)| {
                        Ok(StatusCount {
                            context_id: ContextId(ctx),
                            status: WorkItemStatus::from_str(&status)?,
                            count,
                        })
                    })
                    .collect()
            })
            .await
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup() -> WorkItemStore {
        let db = Database::open_in_memory_and_migrate().await.unwrap();
        WorkItemStore::new(db)
    }

    #[test]
    fn transition_table() {
        use WorkItemStatus::*;
        assert!(Open.can_transition_to(Done));
        assert!(Open.can_transition_to(Archived));
        assert!(Done.can_transition_to(Archived));
        assert!(!Done.can_transition_to(Open));
        assert!(!Done.can_transition_to(Done));
        assert!(!Archived.can_transition_to(Open));
        assert!(!Archived.can_transition_to(Done));
        assert!(!Archived.can_transition_to(Archived));
    }

    #[test]
    fn accuracy_is_clamped() {
        let mut item = WorkItem {
            id: 1,
            context_id: ContextId(1),
            title: "x".into(),
            status: WorkItemStatus::Done,
            priority: 2,
            estimated_minutes: Some(90),
            actual_minutes: Some(60),
            embedding: None,
            deadline: None,
            deadline_text: None,
            assignee_name: None,
            project: None,
            requester_id: None,
            created_at: Utc::now(),
            completed_at: Some(Utc::now()),
        };
        assert!((item.estimation_accuracy().unwrap() - 0.5).abs() < 1e-9);

        item.estimated_minutes = Some(400);
        assert_eq!(item.estimation_accuracy(), Some(0.0));

        item.estimated_minutes = None;
        assert_eq!(item.estimation_accuracy(), None);
    }

    #[tokio::test]
    async fn create_and_get() {
        let store = setup().await;
        let mut input = NewWorkItem::new(ContextId(2), "  Prepare tender docs ");
        input.estimated_minutes = Some(90);
        input.priority = 1;

        let created = store.create(input).await.unwrap();
        assert_eq!(created.title, "Prepare tender docs");
        assert_eq!(created.status, WorkItemStatus::Open);
        assert_eq!(created.actual_minutes, None);

        let fetched = store.get(created.id).await.unwrap();
        assert_eq!(fetched.context_id, ContextId(2));
        assert_eq!(fetched.estimated_minutes, Some(90));
        assert_eq!(fetched.priority, 1);
    }

    #[tokio::test]
    async fn get_missing_is_not_found() {
        let store = setup().await;
        let err = store.get(42).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn create_rejects_blank_title() {
        let store = setup().await;
        let err = store
            .create(NewWorkItem::new(ContextId(1), "   "))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn complete_once_then_conflict() {
        let store = setup().await;
        let item = store
            .create(NewWorkItem::new(ContextId(1), "Call supplier"))
            .await
            .unwrap();

        let done = store.complete(item.id, 45).await.unwrap();
        assert_eq!(done.status, WorkItemStatus::Done);
        assert_eq!(done.actual_minutes, Some(45));
        assert!(done.completed_at.is_some());

        let err = store.complete(item.id, 90).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::InvalidTransition { from: "done", to: "done", .. }
        ));
        assert_eq!(store.get(item.id).await.unwrap().actual_minutes, Some(45));
    }

    #[tokio::test]
    async fn complete_rejects_out_of_range_duration() {
        let store = setup().await;
        let item = store
            .create(NewWorkItem::new(ContextId(1), "x"))
            .await
            .unwrap();
        assert!(matches!(
            store.complete(item.id, 0).await.unwrap_err(),
            StoreError::InvalidArgument(_)
        ));
        assert!(matches!(
            store.complete(item.id, 481).await.unwrap_err(),
            StoreError::InvalidArgument(_)
        ));
        assert_eq!(store.get(item.id).await.unwrap().status, WorkItemStatus::Open);
    }

    #[tokio::test]
    async fn archive_from_open_and_done_only() {
        let store = setup().await;
        let a = store.create(NewWorkItem::new(ContextId(1), "a")).await.unwrap();
        let b = store.create(NewWorkItem::new(ContextId(1), "b")).await.unwrap();

        assert_eq!(
            store.archive(a.id).await.unwrap().status,
            WorkItemStatus::Archived
        );

        store.complete(b.id, 30).await.unwrap();
        let archived = store.archive(b.id).await.unwrap();
        assert_eq!(archived.actual_minutes, Some(30));

        let err = store.archive(b.id).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { from: "archived", .. }));
        let err = store.complete(a.id, 10).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn update_keeps_context() {
        let store = setup().await;
        let item = store.create(NewWorkItem::new(ContextId(3), "a")).await.unwrap();
        let updated = store
            .update(
                item.id,
                WorkItemUpdate {
                    title: Some("renamed".into()),
                    priority: Some(4),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.title, "renamed");
        assert_eq!(updated.priority, 4);
        assert_eq!(updated.context_id, ContextId(3));
    }

    #[tokio::test]
    async fn missing_embeddings_listed_until_backfilled() {
        let store = setup().await;
        let item = store.create(NewWorkItem::new(ContextId(1), "a")).await.unwrap();
        assert_eq!(store.list_missing_embeddings(10).await.unwrap().len(), 1);

        store.update_embedding(item.id, vec![0.1, 0.2]).await.unwrap();
        assert!(store.list_missing_embeddings(10).await.unwrap().is_empty());
        assert_eq!(
            store.get(item.id).await.unwrap().embedding,
            Some(vec![0.1, 0.2])
        );
    }

    #[tokio::test]
    async fn failed_attempts_move_items_back() {
        let store = setup().await;
        let old = store.create(NewWorkItem::new(ContextId(1), "a")).await.unwrap();
        let new = store.create(NewWorkItem::new(ContextId(1), "b")).await.unwrap();

        assert_eq!(store.record_embedding_failure(old.id).await.unwrap(), 1);
        let ids: Vec<_> = store
            .list_missing_embeddings(10)
            .await
            .unwrap()
            .iter()
            .map(|i| i.id)
            .collect();
        assert_eq!(ids, vec![new.id, old.id]);

        assert!(matches!(
            store.record_embedding_failure(9_999).await,
            Err(StoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn deadline_survives_storage() {
        let store = setup().await;
        let deadline = NaiveDateTime::parse_from_str("2026-03-01T17:00:00", DEADLINE_FORMAT).unwrap();
        let mut input = NewWorkItem::new(ContextId(1), "a");
        input.deadline = Some(deadline);
        let item = store.create(input).await.unwrap();
        assert_eq!(store.get(item.id).await.unwrap().deadline, Some(deadline));
    }

    #[tokio::test]
    async fn completed_between_excludes_later_completions() {
        let store = setup().await;
        let a = store.create(NewWorkItem::new(ContextId(1), "a")).await.unwrap();
        store.complete(a.id, 20).await.unwrap();
        let now = Utc::now();

        let week = chrono::Duration::days(7);
        let current = store
            .list_completed_between(ContextId(1), now - week, now + chrono::Duration::minutes(1))
            .await
            .unwrap();
        assert_eq!(current.len(), 1);

        let past = store
            .list_completed_between(ContextId(1), now - week * 2, now - week)
            .await
            .unwrap();
        assert!(past.is_empty());
        let other = store
            .list_completed_between(ContextId(2), now - week, now)
            .await
            .unwrap();
        assert!(other.is_empty());
    }

    #[tokio::test]
    async fn count_by_status_groups() {
        let store = setup().await;
        store.create(NewWorkItem::new(ContextId(1), "a")).await.unwrap();
        store.create(NewWorkItem::new(ContextId(1), "b")).await.unwrap();
        let c = store.create(NewWorkItem::new(ContextId(2), "c")).await.unwrap();
        store.complete(c.id, 20).await.unwrap();

        let counts = store.count_by_status().await.unwrap();
        assert_eq!(
            counts,
            vec![
                StatusCount { context_id: ContextId(1), status: WorkItemStatus::Open, count: 2 },
                StatusCount { context_id: ContextId(2), status: WorkItemStatus::Done, count: 1 },
            ]
        );
    }
}
