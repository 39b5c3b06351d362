//! # bizplanner-estimator
//!
//! Estimates how long a new work item will take using only completed
//! items from the same isolation context.
//!
//! ```text
//!  embedding ──▶ IsolatedRetriever ──▶ Neighbors ──▶ DurationEstimator ──▶ EstimationResult
//!                  (VectorIndex,          (≥ min_similarity,   (weighted avg,
//!                   context re-check)      top k)               tiers, clamp)
//! ```

pub mod defaults;
pub mod error;
pub mod estimator;
pub mod retriever;

pub use defaults::{Category, CategoryDefaults, GLOBAL_DEFAULT_MINUTES};
pub use error::{EstimatorError, Result};
pub use estimator::{
    Confidence, DurationEstimator, EstimateSource, EstimationResult, EstimatorConfig,
    clamp_minutes, confidence_tier, estimate_from_neighbors, weighted_average,
};
pub use retriever::{IsolatedRetriever, Neighbor};
