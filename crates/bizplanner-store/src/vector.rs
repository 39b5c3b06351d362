//! Context-scoped vector index.
//!
//! Embeddings live in the `embedding` BLOB column of `work_items` as
//! little-endian `f32`s. The index answers nearest-neighbour queries over
//! completed items of a single context by brute-force cosine similarity,
//! which is plenty for the few thousand items a context accumulates.
//!
//! [`VectorIndex`] is the seam the retriever talks to. Implementations
//! report each hit's own `context_id` so the caller can re-validate
//! isolation instead of trusting the filter.

use std::cmp::Ordering;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{instrument, warn};

use crate::db::Database;
use crate::error::{StoreError, StoreResult};
use crate::work_item::{ContextId, ItemId};

// ═══════════════════════════════════════════════════════════════════════
//  Types
// ═══════════════════════════════════════════════════════════════════════

/// One raw result from a vector index.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexHit {
    pub item_id: ItemId,
    /// Context the hit actually belongs to, as stored.
    pub context_id: ContextId,
    /// Raw cosine similarity in `[-1, 1]`.
    pub similarity: f32,
    pub actual_minutes: u32,
    pub completed_at: Option<DateTime<Utc>>,
}

/// An entry stored in [`MemoryVectorIndex`].
#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub item_id: ItemId,
    pub context_id: ContextId,
    pub embedding: Vec<f32>,
    pub actual_minutes: u32,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Nearest-neighbour lookup restricted to one context.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Up to `k` completed items of `context_id`, most similar first.
    ///
    /// Equal similarities are ordered by later `completed_at`, then by
    /// smaller item id.
    async fn nearest(
        &self,
        query: &[f32],
        context_id: ContextId,
        k: usize,
    ) -> StoreResult<Vec<IndexHit>>;
}

// ═══════════════════════════════════════════════════════════════════════
//  SQLite-backed index
// ═══════════════════════════════════════════════════════════════════════

/// Index that scans the `work_items` table.
///
/// Eligible rows are `done` or `archived`, with an actual duration and an
/// embedding. Rows whose embedding length differs from the query are
/// skipped with a warning.
#[derive(Clone)]
pub struct SqliteVectorIndex {
    db: Database,
}

impl SqliteVectorIndex {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl VectorIndex for SqliteVectorIndex {
    #[instrument(skip(self, query), fields(dim = query.len()))]
    async fn nearest(
        &self,
        query: &[f32],
        context_id: ContextId,
        k: usize,
    ) -> StoreResult<Vec<IndexHit>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        // Rows are loaded on a reader connection; scoring happens after the
        // connection is released.
        let rows = self
            .db
            .execute_read(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, context_id, embedding, actual_minutes, completed_at \
                     FROM work_items \
                     WHERE context_id = ?1 AND status IN ('done','archived') \
                     AND actual_minutes IS NOT NULL AND embedding IS NOT NULL",
                )?;
                let rows = stmt
                    .query_map([context_id.0], |row| {
                        Ok(CandidateRow {
                            id: row.get(0)?,
                            context_id: row.get(1)?,
                            embedding: row.get(2)?,
                            actual_minutes: row.get(3)?,
                            completed_at: row.get(4)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        let query = query.to_vec();
        tokio::task::spawn_blocking(move || score(&query, rows, k)).await?
    }
}

struct CandidateRow {
    id: i64,
    context_id: i64,
    embedding: Vec<u8>,
    actual_minutes: i64,
    completed_at: Option<i64>,
}

fn score(query: &[f32], rows: Vec<CandidateRow>, k: usize) -> StoreResult<Vec<IndexHit>> {
    let mut hits = Vec::with_capacity(rows.len());
    for row in rows {
        let embedding = blob_to_embedding(row.embedding);
        let Some(similarity) = cosine_similarity(query, &embedding) else {
            warn!(
                item_id = row.id,
                stored_dim = embedding.len(),
                query_dim = query.len(),
                "skipping embedding with mismatched dimension"
            );
            continue;
        };
        let actual = row.actual_minutes;
        let actual_minutes = u32::try_from(actual).map_err(|_| {
            StoreError::InvalidArgument(format!("actual_minutes out of range: {actual}"))
        })?;
        hits.push(IndexHit {
            item_id: row.id,
            context_id: ContextId(row.context_id),
            similarity,
            actual_minutes,
            completed_at: row.completed_at.and_then(DateTime::from_timestamp_millis),
        });
    }
    Ok(top_k(hits, k))
}

// ═══════════════════════════════════════════════════════════════════════
//  In-memory index
// ═══════════════════════════════════════════════════════════════════════

/// Lock-free in-memory index, used for tests and dry runs.
#[derive(Default)]
pub struct MemoryVectorIndex {
    entries: DashMap<ItemId, IndexEntry>,
}

impl MemoryVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the entry for `entry.item_id`.
    pub fn upsert(&self, entry: IndexEntry) {
        self.entries.insert(entry.item_id, entry);
    }
}

#[async_trait]
impl VectorIndex for MemoryVectorIndex {
    async fn nearest(
        &self,
        query: &[f32],
        context_id: ContextId,
        k: usize,
    ) -> StoreResult<Vec<IndexHit>> {
        let hits = self
            .entries
            .iter()
            .filter(|entry| entry.context_id == context_id)
            .filter_map(|entry| {
                let similarity = cosine_similarity(query, &entry.embedding)?;
                Some(IndexHit {
                    item_id: entry.item_id,
                    context_id: entry.context_id,
                    similarity,
                    actual_minutes: entry.actual_minutes,
                    completed_at: entry.completed_at,
                })
            })
            .collect();
        Ok(top_k(hits, k))
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Helpers
// ═══════════════════════════════════════════════════════════════════════

/// Cosine similarity of two vectors.
///
/// `None` when the lengths differ, either vector is empty, or either has
/// zero norm.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }
    let (mut dot, mut norm_a, mut norm_b) = (0.0_f64, 0.0_f64, 0.0_f64);
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return None;
    }
    Some((dot / (norm_a.sqrt() * norm_b.sqrt())) as f32)
}

/// Ordering used for every ranked hit list.
pub fn rank_order(a: &IndexHit, b: &IndexHit) -> Ordering {
    b.similarity
        .partial_cmp(&a.similarity)
        .unwrap_or(Ordering::Equal)
        .then_with(|| b.completed_at.cmp(&a.completed_at))
        .then_with(|| a.item_id.cmp(&b.item_id))
}

fn top_k(mut hits: Vec<IndexHit>, k: usize) -> Vec<IndexHit> {
    hits.sort_by(rank_order);
    hits.truncate(k);
    hits
}

/// Serialize an embedding as little-endian `f32` bytes.
pub(crate) fn embedding_to_blob(embedding: Vec<f32>) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(embedding.len() * 4);
    for val in &embedding {
        bytes.extend_from_slice(&val.to_le_bytes());
    }
    bytes
}

/// Inverse of [`embedding_to_blob`]. Trailing bytes that do not form a
/// whole `f32` are ignored.
pub(crate) fn blob_to_embedding(blob: Vec<u8>) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

// ── tests ────────────────────────────────────────────────────────────
