//! Adapter error types.
//!
//! Every adapter failure says whether it is transient (timeout, rate
//! limit, upstream 5xx) so the workflow engine can decide to retry.

/// Errors raised by external-collaborator adapters.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    // -- Per-capability failures ---------------------------------------------
    #[error("transcription failed: {reason}")]
    Transcription { reason: String, transient: bool },

    /// The parser's output did not validate against the declared schema.
    #[error("could not parse request: {reason}")]
    Parse { reason: String },

    /// The parser service itself failed (as opposed to returning bad data).
    #[error("parser request failed: {reason}")]
    ParserUnavailable { reason: String, transient: bool },

    #[error("embedding failed: {reason}")]
    Embedding { reason: String, transient: bool },

    // -- Configuration -------------------------------------------------------
    #[error("missing api key for {service}")]
    MissingApiKey { service: &'static str },

    #[error("adapter configuration error: {0}")]
    Config(String),
}

impl AdapterError {
    pub fn parse(reason: impl Into<String>) -> Self {
        Self::Parse {
            reason: reason.into(),
        }
    }

    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transcription { transient, .. }
            | Self::ParserUnavailable { transient, .. }
            | Self::Embedding { transient, .. } => *transient,
            Self::Parse { .. } | Self::MissingApiKey { .. } | Self::Config(_) => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, AdapterError>;
