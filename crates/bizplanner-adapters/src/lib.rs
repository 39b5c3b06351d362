//! # bizplanner-adapters
//!
//! Thin typed wrappers around the external services the creation workflow
//! depends on: speech-to-text, structured parsing and embeddings. The
//! traits in [`traits`] are the seam; [`OpenAiClient`] is the production
//! implementation and tests supply scripted fakes.

pub mod error;
pub mod openai;
pub mod parsed;
pub mod traits;

pub use error::{AdapterError, Result};
pub use openai::{OPENAI_BASE_URL, OpenAiClient, OpenAiConfig};
pub use parsed::{DEFAULT_PRIORITY, MAX_TITLE_CHARS, ParsedRequest};
pub use traits::{EmbeddingGenerator, StructuredParser, Transcriber, Transcript};
