//! Engine error types.
//!
//! Two families: [`SchemaError`] is raised once, when a graph is compiled;
//! [`StepError`] is raised by steps at run time and carries an
//! [`ErrorKind`] that drives retry and error routing.

use std::fmt;

use crate::step::StepId;

/// Classification of a step failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed input. Never retried.
    Validation,
    /// Timeout or rate limit from an external collaborator. Retried per
    /// the step's policy.
    TransientExternal,
    /// A retrieval result crossed context boundaries. Always fatal.
    IsolationBreach,
    NotFound,
    ConstraintViolation,
    /// Illegal lifecycle change; surfaced to the caller as a conflict.
    InvalidTransition,
    /// Non-transient failure reported by an external collaborator.
    External,
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::TransientExternal => "transient_external",
            Self::IsolationBreach => "isolation_breach",
            Self::NotFound => "not_found",
            Self::ConstraintViolation => "constraint_violation",
            Self::InvalidTransition => "invalid_transition",
            Self::External => "external",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure raised by a step.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {detail}")]
pub struct StepError {
    pub kind: ErrorKind,
    pub detail: String,
}

impl StepError {
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    pub fn validation(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, detail)
    }

    pub fn transient(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::TransientExternal, detail)
    }

    pub fn isolation_breach(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::IsolationBreach, detail)
    }

    pub fn not_found(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, detail)
    }

    pub fn constraint(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConstraintViolation, detail)
    }

    pub fn invalid_transition(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidTransition, detail)
    }

    pub fn external(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::External, detail)
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, detail)
    }

    /// Only [`ErrorKind::TransientExternal`] is eligible for retry.
    pub fn is_transient(&self) -> bool {
        self.kind == ErrorKind::TransientExternal
    }
}

/// A graph failed static validation and cannot be executed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaError {
    // -- Structure -----------------------------------------------------------
    #[error("graph `{graph}` has no entry step")]
    MissingEntry { graph: &'static str },

    #[error("step `{step}` is declared twice")]
    DuplicateStep { step: StepId },

    #[error("step `{step}` references unknown step `{target}`")]
    UnknownStep { step: StepId, target: StepId },

    #[error("router on step `{step}` declares no targets")]
    EmptyRoute { step: StepId },

    #[error("step `{step}` is unreachable from the entry step")]
    Unreachable { step: StepId },

    #[error("step `{step}` has an invalid retry policy: {reason}")]
    InvalidRetry { step: StepId, reason: String },

    // -- Data flow -----------------------------------------------------------
    /// A required input is not produced on every path into the step.
    #[error("step `{step}` requires field {field} which is not available on every path")]
    MissingInput { step: StepId, field: String },
}

/// Convenience alias for graph compilation.
pub type Result<T> = std::result::Result<T, SchemaError>;
