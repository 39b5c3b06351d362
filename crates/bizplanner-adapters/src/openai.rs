//! OpenAI-compatible HTTP implementation of all three adapters.
//!
//! Uses the audio transcription, chat completions (JSON mode) and
//! embeddings endpoints. Any OpenAI-compatible server works as long as
//! `base_url` points at its `/v1` root.

use std::time::Duration;

use async_trait::async_trait;
use bizplanner_store::ContextId;
use reqwest::StatusCode;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use serde_json::{Value, json};
use tracing::{debug, instrument};

use crate::error::{AdapterError, Result};
use crate::parsed::ParsedRequest;
use crate::traits::{EmbeddingGenerator, StructuredParser, Transcriber, Transcript};

/// Default OpenAI API base URL.
pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// Whisper reports no confidence; this is what a successful transcription
/// is assumed to carry.
const ASSUMED_TRANSCRIPTION_CONFIDENCE: f32 = 0.95;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Endpoint, models and prompt context for [`OpenAiClient`].
#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub base_url: String,
    pub transcription_model: String,
    pub parser_model: String,
    pub embedding_model: String,
    /// ISO-639-1 hint for transcription, e.g. `ru`.
    pub language: Option<String>,
    pub timeout: Duration,
    /// Contexts the parser may assign, `(id, display name)`.
    pub contexts: Vec<(ContextId, String)>,
}

impl OpenAiConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: OPENAI_BASE_URL.to_owned(),
            transcription_model: "whisper-1".into(),
            parser_model: "gpt-5-nano".into(),
            embedding_model: "text-embedding-3-small".into(),
            language: Some("ru".into()),
            timeout: Duration::from_secs(30),
            contexts: Vec::new(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_owned();
        self
    }

    pub fn with_contexts(mut self, contexts: Vec<(ContextId, String)>) -> Self {
        self.contexts = contexts;
        self
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// One HTTP client serving transcription, parsing and embeddings.
#[derive(Debug, Clone)]
pub struct OpenAiClient {
    config: OpenAiConfig,
    http: reqwest::Client,
}

/// Which capability a request belongs to, for error mapping.
#[derive(Debug, Clone, Copy)]
enum Capability {
    Transcription,
    Parsing,
    Embedding,
}

impl Capability {
    fn error(self, reason: String, transient: bool) -> AdapterError {
        match self {
            Self::Transcription => AdapterError::Transcription { reason, transient },
            Self::Parsing => AdapterError::ParserUnavailable { reason, transient },
            Self::Embedding => AdapterError::Embedding { reason, transient },
        }
    }
}

impl OpenAiClient {
    pub fn new(config: OpenAiConfig) -> Result<Self> {
        if config.api_key.trim().is_empty() {
            return Err(AdapterError::MissingApiKey { service: "openai" });
        }

        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| AdapterError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { config, http })
    }

    pub fn config(&self) -> &OpenAiConfig {
        &self.config
    }

    fn auth_headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        let value = HeaderValue::from_str(&format!("Bearer {}", self.config.api_key))
            .map_err(|e| AdapterError::Config(format!("invalid authorization header: {e}")))?;
        headers.insert(AUTHORIZATION, value);
        Ok(headers)
    }

    /// Send a request and decode a JSON body, classifying failures.
    async fn send(&self, capability: Capability, request: reqwest::RequestBuilder) -> Result<Value> {
        let resp = request
            .headers(self.auth_headers()?)
            .send()
            .await
            .map_err(|e| capability.error(e.to_string(), is_transient_transport(&e)))?;

        let status = resp.status();
        let text = resp.text().await.map_err(|e| {
            capability.error(
                format!("failed to read response body: {e}"),
                is_transient_transport(&e),
            )
        })?;

        if !status.is_success() {
            return Err(capability.error(
                format!("API returned {status}: {text}"),
                is_transient_status(status),
            ));
        }

        serde_json::from_str(&text)
            .map_err(|e| capability.error(format!("invalid JSON response: {e}"), false))
    }
}

#[async_trait]
impl Transcriber for OpenAiClient {
    #[instrument(skip(self, audio), fields(bytes = audio.len()))]
    async fn transcribe(&self, audio: &[u8]) -> Result<Transcript> {
        if audio.is_empty() {
            return Err(AdapterError::Transcription {
                reason: "audio is empty".into(),
                transient: false,
            });
        }

        let file = reqwest::multipart::Part::bytes(audio.to_vec())
            .file_name("voice.ogg")
            .mime_str("audio/ogg")
            .map_err(|e| AdapterError::Config(format!("invalid mime type: {e}")))?;
        let mut form = reqwest::multipart::Form::new()
            .text("model", self.config.transcription_model.clone())
            .text("response_format", "json")
            .part("file", file);
        if let Some(language) = &self.config.language {
            form = form.text("language", language.clone());
        }

        let url = format!("{}/audio/transcriptions", self.config.base_url);
        debug!(url = %url, model = %self.config.transcription_model, "sending transcription request");
        let body = self
            .send(Capability::Transcription, self.http.post(&url).multipart(form))
            .await?;

        let text = body["text"]
            .as_str()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| AdapterError::Transcription {
                reason: "response contained no text".into(),
                transient: false,
            })?;

        Ok(Transcript {
            text: text.to_owned(),
            confidence: ASSUMED_TRANSCRIPTION_CONFIDENCE,
        })
    }
}

#[async_trait]
impl StructuredParser for OpenAiClient {
    #[instrument(skip(self, text, recent_context), fields(chars = text.len()))]
    async fn parse(&self, text: &str, recent_context: Option<&str>) -> Result<ParsedRequest> {
        let body = build_parse_body(&self.config, text, recent_context);
        let url = format!("{}/chat/completions", self.config.base_url);
        debug!(url = %url, model = %self.config.parser_model, "sending parse request");

        let response = self
            .send(Capability::Parsing, self.http.post(&url).json(&body))
            .await?;

        let content = response["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| AdapterError::parse("response contained no message content"))?;
        let value: Value = serde_json::from_str(content)
            .map_err(|e| AdapterError::parse(format!("message content is not JSON: {e}")))?;

        ParsedRequest::from_json(value)
    }
}

#[async_trait]
impl EmbeddingGenerator for OpenAiClient {
    #[instrument(skip(self, text), fields(chars = text.len()))]
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let body = json!({
            "model": self.config.embedding_model,
            "input": text,
        });
        let url = format!("{}/embeddings", self.config.base_url);
        let response = self
            .send(Capability::Embedding, self.http.post(&url).json(&body))
            .await?;
        parse_embedding(&response)
    }
}

// ---------------------------------------------------------------------------
// Request / response helpers
// ---------------------------------------------------------------------------

/// Rate limits, timeouts and upstream 5xx are worth retrying.
pub fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}

fn is_transient_transport(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

fn build_parse_body(config: &OpenAiConfig, text: &str, recent_context: Option<&str>) -> Value {
    let contexts = config
        .contexts
        .iter()
        .map(|(id, name)| format!("{id} = {name}"))
        .collect::<Vec<_>>()
        .join(", ");

    let system = format!(
        "Extract a work item from the user's message. Reply with a JSON object with keys: \
         title (short imperative), business_id (one of: {contexts}), deadline_text \
         (ISO 8601 date or date-time, or null), project_name, assigned_to_name, \
         priority (1 = do now, 2 = schedule, 3 = delegate, 4 = backlog)."
    );

    let mut user = text.to_owned();
    if let Some(recent) = recent_context.filter(|r| !r.trim().is_empty()) {
        user = format!("Recent context:\n{recent}\n\nMessage:\n{text}");
    }

    json!({
        "model": config.parser_model,
        "response_format": { "type": "json_object" },
        "messages": [
            { "role": "system", "content": system },
            { "role": "user", "content": user },
        ],
    })
}

fn parse_embedding(response: &Value) -> Result<Vec<f32>> {
    let values = response["data"][0]["embedding"]
        .as_array()
        .ok_or_else(|| AdapterError::Embedding {
            reason: "response contained no embedding".into(),
            transient: false,
        })?;

    values
        .iter()
        .map(|v| {
            v.as_f64().map(|f| f as f32).ok_or_else(|| AdapterError::Embedding {
                reason: "embedding contains a non-numeric value".into(),
                transient: false,
            })
        })
        .collect()
}
