//! Estimator error types.

use bizplanner_store::{ContextId, ItemId, StoreError};

/// Errors raised by retrieval and estimation.
#[derive(Debug, thiserror::Error)]
pub enum EstimatorError {
    // -- Isolation -----------------------------------------------------------
    /// The index returned an item from a context other than the one queried.
    /// Always fatal; never filtered out.
    #[error(
        "isolation breach: query for context {expected} returned item {item_id} from context {found}"
    )]
    IsolationBreach {
        expected: ContextId,
        found: ContextId,
        item_id: ItemId,
    },

    // -- Arguments -----------------------------------------------------------
    #[error("unknown context: {0}")]
    UnknownContext(ContextId),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    // -- Upstream ------------------------------------------------------------
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, EstimatorError>;
