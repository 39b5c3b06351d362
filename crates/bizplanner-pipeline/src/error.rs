//! Pipeline error types and the mapping of lower-layer errors onto the
//! engine's [`ErrorKind`] taxonomy.

use bizplanner_adapters::AdapterError;
use bizplanner_engine::{ErrorKind, SchemaError, StepError};
use bizplanner_estimator::EstimatorError;
use bizplanner_store::StoreError;

/// Errors surfaced to callers of the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    // -- Setup ---------------------------------------------------------------
    #[error("configuration error: {0}")]
    Config(String),

    #[error("workflow schema error: {0}")]
    Schema(#[from] SchemaError),

    // -- Request outcome -----------------------------------------------------
    /// A workflow run failed. `message` is safe to show to the requester;
    /// `error` carries the detail for logs.
    #[error("{message} ({error})")]
    Rejected { message: String, error: StepError },

    #[error("request cancelled before anything was saved")]
    Cancelled,

    #[error("invalid input: {0}")]
    Validation(String),

    // -- Upstream ------------------------------------------------------------
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Estimator(#[from] EstimatorError),

    #[error(transparent)]
    Adapter(#[from] AdapterError),
}

impl PipelineError {
    /// The taxonomy kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) | Self::Schema(_) | Self::Cancelled => ErrorKind::Internal,
            Self::Rejected { error, .. } => error.kind,
            Self::Validation(_) => ErrorKind::Validation,
            Self::Store(e) => store_error(e).kind,
            Self::Estimator(e) => estimator_error(e).kind,
            Self::Adapter(e) => adapter_error(e).kind,
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

// ---------------------------------------------------------------------------
// Step error mapping
// ---------------------------------------------------------------------------

pub fn store_error(err: &StoreError) -> StepError {
    let detail = err.to_string();
    match err {
        StoreError::NotFound { .. } => StepError::not_found(detail),
        StoreError::ConstraintViolation(_) => StepError::constraint(detail),
        StoreError::InvalidTransition { .. } => StepError::invalid_transition(detail),
        StoreError::InvalidArgument(_) => StepError::validation(detail),
        StoreError::Sqlite(rusqlite::Error::SqliteFailure(code, _))
            if matches!(
                code.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ) =>
        {
            StepError::transient(detail)
        }
        StoreError::Sqlite(_) | StoreError::Migration { .. } | StoreError::TaskJoin(_) => {
            StepError::internal(detail)
        }
    }
}

pub fn estimator_error(err: &EstimatorError) -> StepError {
    let detail = err.to_string();
    match err {
        EstimatorError::IsolationBreach { .. } => StepError::isolation_breach(detail),
        EstimatorError::UnknownContext(_) | EstimatorError::InvalidArgument(_) => {
            StepError::validation(detail)
        }
        EstimatorError::Store(e) => store_error(e),
    }
}

pub fn adapter_error(err: &AdapterError) -> StepError {
    let detail = err.to_string();
    if err.is_transient() {
        return StepError::transient(detail);
    }
    match err {
        AdapterError::Parse { .. } => StepError::validation(detail),
        AdapterError::MissingApiKey { .. } | AdapterError::Config(_) => {
            StepError::internal(detail)
        }
        _ => StepError::external(detail),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bizplanner_store::ContextId;

    #[test]
    fn store_errors_keep_their_kind() {
        let err = StoreError::InvalidTransition {
            id: 1,
            from: "done",
            to: "done",
        };
        assert_eq!(store_error(&err).kind, ErrorKind::InvalidTransition);
        assert_eq!(
            store_error(&StoreError::ConstraintViolation("x".into())).kind,
            ErrorKind::ConstraintViolation
        );
    }

    #[test]
    fn cancellation_is_not_an_external_failure() {
        assert_eq!(PipelineError::Cancelled.kind(), ErrorKind::Internal);
        assert!(!PipelineError::Cancelled.kind().is_transient());
    }

    #[test]
    fn isolation_breach_is_never_transient() {
        let err = EstimatorError::IsolationBreach {
            expected: ContextId(1),
            found: ContextId(2),
            item_id: 7,
        };
        let mapped = estimator_error(&err);
        assert_eq!(mapped.kind, ErrorKind::IsolationBreach);
        assert!(!mapped.is_transient());
    }

    #[test]
    fn adapter_transience_is_preserved() {
        let rate_limited = AdapterError::Embedding {
            reason: "429".into(),
            transient: true,
        };
        assert!(adapter_error(&rate_limited).is_transient());
        assert_eq!(
            adapter_error(&AdapterError::parse("no title")).kind,
            ErrorKind::Validation
        );
        let broken = AdapterError::Transcription {
            reason: "bad audio".into(),
            transient: false,
        };
        assert_eq!(adapter_error(&broken).kind, ErrorKind::External);
    }
}
