//! Error types for the bizplanner-store crate.
//!
//! All storage operations return [`StoreError`] via [`StoreResult`].

use thiserror::Error;

/// Alias for `Result<T, StoreError>`.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in the storage engine.
#[derive(Debug, Error)]
pub enum StoreError {
    /// SQLite operation failed for a reason other than a constraint.
    #[error("sqlite error: {0}")]
    Sqlite(rusqlite::Error),

    /// A schema migration failed.
    #[error("migration v{version} failed: {message}")]
    Migration { version: u32, message: String },

    /// The requested record was not found.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// The write was rejected by a schema constraint (NOT NULL, CHECK,
    /// immutable column trigger).
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    /// The requested lifecycle change is not legal from the current status.
    #[error("invalid transition for work item {id}: {from} -> {to}")]
    InvalidTransition {
        id: i64,
        from: &'static str,
        to: &'static str,
    },

    /// An argument failed validation before reaching the database.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A blocking task was cancelled or panicked.
    #[error("background task failed: {0}")]
    TaskJoin(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::SqliteFailure(code, message)
                if code.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Self::ConstraintViolation(
                    message.unwrap_or_else(|| "constraint failed".to_string()),
                )
            }
            other => Self::Sqlite(other),
        }
    }
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::TaskJoin(err.to_string())
    }
}
