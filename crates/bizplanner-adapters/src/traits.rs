//! Adapter contracts consumed by the creation workflow.

use async_trait::async_trait;

use crate::error::Result;
use crate::parsed::ParsedRequest;

/// Output of a transcription.
#[derive(Debug, Clone, PartialEq)]
pub struct Transcript {
    pub text: String,
    /// Service-reported confidence in `[0, 1]`.
    pub confidence: f32,
}

/// Speech to text.
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, audio: &[u8]) -> Result<Transcript>;
}

/// Free text to a structured request.
///
/// Implementations return [`AdapterError::Parse`](crate::AdapterError::Parse)
/// when the service answers with something that does not fit
/// [`ParsedRequest`].
#[async_trait]
pub trait StructuredParser: Send + Sync {
    async fn parse(&self, text: &str, recent_context: Option<&str>) -> Result<ParsedRequest>;
}

/// Text to a fixed-length vector.
#[async_trait]
pub trait EmbeddingGenerator: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}
