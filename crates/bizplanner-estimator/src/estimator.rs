//! Duration estimation from a context's own history.
//!
//! Neighbours are combined by a similarity-weighted average over all of
//! them, so several moderately similar items outweigh one very similar
//! outlier. With no neighbours the estimate falls back to the category
//! default table.

use std::fmt;

use bizplanner_store::{ContextId, MAX_MINUTES, MIN_MINUTES};
use serde::Serialize;
use tracing::{debug, instrument};

use crate::defaults::CategoryDefaults;
use crate::error::Result;
use crate::retriever::{IsolatedRetriever, Neighbor};

/// Neighbour count required for `high` confidence.
const HIGH_MIN_NEIGHBORS: usize = 3;
/// Mean similarity required for `high` confidence.
const HIGH_MIN_SIMILARITY: f32 = 0.85;
/// Mean similarity required for `medium` confidence.
const MEDIUM_MIN_SIMILARITY: f32 = 0.75;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Coarse reliability of an estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

impl Confidence {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where an estimate came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EstimateSource {
    History,
    Default,
}

/// Outcome of one estimation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EstimationResult {
    /// Always within `[1, 480]`.
    pub minutes: u32,
    pub confidence: Confidence,
    pub neighbor_count: usize,
    pub source: EstimateSource,
}

/// Retrieval parameters and cold-start defaults.
#[derive(Debug, Clone)]
pub struct EstimatorConfig {
    pub k: usize,
    pub min_similarity: f32,
    pub defaults: CategoryDefaults,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            k: 5,
            min_similarity: 0.7,
            defaults: CategoryDefaults::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Estimator
// ---------------------------------------------------------------------------

/// Turns a query embedding into an [`EstimationResult`].
#[derive(Clone)]
pub struct DurationEstimator {
    retriever: IsolatedRetriever,
    config: EstimatorConfig,
}

impl DurationEstimator {
    pub fn new(retriever: IsolatedRetriever, config: EstimatorConfig) -> Self {
        Self { retriever, config }
    }

    pub fn config(&self) -> &EstimatorConfig {
        &self.config
    }

    /// Estimate a new item's duration from completed items of the same
    /// context. Zero neighbours is a cold start, not an error.
    #[instrument(skip(self, embedding), fields(dim = embedding.len()))]
    pub async fn estimate(
        &self,
        embedding: &[f32],
        context_id: ContextId,
        title: &str,
    ) -> Result<EstimationResult> {
        let neighbors = self
            .retriever
            .find_similar(embedding, context_id, self.config.k, self.config.min_similarity)
            .await?;

        let result = estimate_from_neighbors(&neighbors, title, &self.config.defaults);
        debug!(
            context_id = %context_id,
            minutes = result.minutes,
            confidence = %result.confidence,
            neighbors = result.neighbor_count,
            "estimate computed"
        );
        Ok(result)
    }

    /// Cold-start estimate without retrieval, for degraded paths.
    pub fn default_estimate(&self, title: &str) -> EstimationResult {
        estimate_from_neighbors(&[], title, &self.config.defaults)
    }
}

// ---------------------------------------------------------------------------
// Pure estimation
// ---------------------------------------------------------------------------

/// Combine neighbours into an estimate.
pub fn estimate_from_neighbors(
    neighbors: &[Neighbor],
    title: &str,
    defaults: &CategoryDefaults,
) -> EstimationResult {
    let Some(average) = weighted_average(neighbors) else {
        return EstimationResult {
            minutes: clamp_minutes(f64::from(defaults.minutes_for(title))),
            confidence: Confidence::Low,
            neighbor_count: 0,
            source: EstimateSource::Default,
        };
    };

    EstimationResult {
        minutes: clamp_minutes(average),
        confidence: confidence_tier(neighbors),
        neighbor_count: neighbors.len(),
        source: EstimateSource::History,
    }
}

/// `Σ(actual·sim) / Σ(sim)`. Falls back to the plain mean if every
/// similarity is zero, and to `None` for an empty set.
pub fn weighted_average(neighbors: &[Neighbor]) -> Option<f64> {
    if neighbors.is_empty() {
        return None;
    }
    let (weighted, weights) = neighbors.iter().fold((0.0_f64, 0.0_f64), |(sum, w), n| {
        let sim = f64::from(n.similarity);
        (sum + f64::from(n.actual_minutes) * sim, w + sim)
    });
    if weights > 0.0 {
        Some(weighted / weights)
    } else {
        let total: f64 = neighbors.iter().map(|n| f64::from(n.actual_minutes)).sum();
        Some(total / neighbors.len() as f64)
    }
}

/// `high`: ≥ 3 neighbours with mean similarity ≥ 0.85.
/// `medium`: ≥ 1 neighbour with mean similarity ≥ 0.75.
/// Otherwise `low`.
pub fn confidence_tier(neighbors: &[Neighbor]) -> Confidence {
    if neighbors.is_empty() {
        return Confidence::Low;
    }
    let mean = neighbors.iter().map(|n| n.similarity).sum::<f32>() / neighbors.len() as f32;
    if neighbors.len() >= HIGH_MIN_NEIGHBORS && mean >= HIGH_MIN_SIMILARITY {
        Confidence::High
    } else if mean >= MEDIUM_MIN_SIMILARITY {
        Confidence::Medium
    } else {
        Confidence::Low
    }
}

/// Clamp to `[1, 480]` and round half-up to whole minutes.
pub fn clamp_minutes(value: f64) -> u32 {
    if value.is_nan() {
        return MIN_MINUTES;
    }
    let clamped = value.clamp(f64::from(MIN_MINUTES), f64::from(MAX_MINUTES));
    (clamped + 0.5).floor() as u32
}
