//! Planner configuration.
//!
//! Loaded from a TOML file (default `config/bizplanner.toml`); a missing
//! file means defaults. A handful of environment variables override the
//! file so secrets never have to live in it.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bizplanner_adapters::{OPENAI_BASE_URL, OpenAiConfig};
use bizplanner_engine::RetryPolicy;
use bizplanner_estimator::{CategoryDefaults, EstimatorConfig, GLOBAL_DEFAULT_MINUTES};
use bizplanner_store::{ContextId, MAX_MINUTES, MIN_MINUTES};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{PipelineError, Result};

/// Default location of the config file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/bizplanner.toml";

/// Upper bound for `pipeline.deadline_secs`; a creation run is interactive.
pub const MAX_DEADLINE_SECS: u64 = 300;
/// Upper bound for `report.completion_window_days`.
pub const MAX_COMPLETION_WINDOW_DAYS: i64 = 366;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    /// `compact` or `json`.
    pub log_format: LogFormat,
    pub database: DatabaseConfig,
    pub openai: OpenAiSection,
    pub retrieval: RetrievalConfig,
    pub pipeline: PipelineConfig,
    pub contexts: Vec<ContextConfig>,
    pub report: ReportConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/bizplanner.db"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenAiSection {
    /// Usually left empty and supplied via `OPENAI_API_KEY`.
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub base_url: String,
    pub transcription_model: String,
    pub parser_model: String,
    pub embedding_model: String,
    pub language: Option<String>,
    pub timeout_secs: u64,
}

impl Default for OpenAiSection {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: OPENAI_BASE_URL.to_owned(),
            transcription_model: "whisper-1".into(),
            parser_model: "gpt-5-nano".into(),
            embedding_model: "text-embedding-3-small".into(),
            language: Some("ru".into()),
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub top_k: usize,
    pub min_similarity: f32,
    pub embedding_dimension: usize,
    /// Estimate used when no category keyword matches a cold-start title.
    pub fallback_minutes: u32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            min_similarity: 0.7,
            embedding_dimension: 1536,
            fallback_minutes: GLOBAL_DEFAULT_MINUTES,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Overall deadline of one creation run.
    pub deadline_secs: u64,
    /// Attempts per external call, including the first.
    pub retry_attempts: u32,
    pub retry_backoff_ms: u64,
    /// Transcripts below this confidence add a warning to the response.
    pub low_confidence_threshold: f32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            deadline_secs: 10,
            retry_attempts: 3,
            retry_backoff_ms: 250,
            low_confidence_threshold: 0.5,
        }
    }
}

/// One isolation context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextConfig {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    /// Five- or six-field cron expression, evaluated in UTC.
    pub cron: String,
    /// Trailing window for the completion summary.
    pub completion_window_days: i64,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            cron: "0 8 * * *".into(),
            completion_window_days: 7,
        }
    }
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            log_format: LogFormat::default(),
            database: DatabaseConfig::default(),
            openai: OpenAiSection::default(),
            retrieval: RetrievalConfig::default(),
            pipeline: PipelineConfig::default(),
            contexts: default_contexts(),
            report: ReportConfig::default(),
        }
    }
}

fn default_contexts() -> Vec<ContextConfig> {
    [(1, "Inventum"), (2, "Inventum Lab"), (3, "R&D"), (4, "Trade")]
        .into_iter()
        .map(|(id, name)| ContextConfig {
            id,
            name: name.to_owned(),
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl PlannerConfig {
    /// Parse a TOML document.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| PipelineError::Config(format!("failed to parse TOML config: {e}")))
    }

    /// Read `path` if it exists, apply environment overrides, validate.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path).map_err(|e| {
                PipelineError::Config(format!("failed to read {}: {e}", path.display()))
            })?;
            debug!(path = %path.display(), "configuration loaded from file");
            Self::from_toml(&content)?
        } else {
            warn!(path = %path.display(), "configuration file does not exist, using defaults");
            Self::default()
        };

        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply `OPENAI_API_KEY` and the `BIZPLANNER_*` overrides.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let lookup = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(key) = lookup("OPENAI_API_KEY") {
            self.openai.api_key = Some(key);
        }
        if let Some(path) = lookup("BIZPLANNER_DATABASE") {
            self.database.path = PathBuf::from(path);
        }
        if let Some(url) = lookup("BIZPLANNER_OPENAI_BASE_URL") {
            self.openai.base_url = url;
        }
        if let Some(format) = lookup("BIZPLANNER_LOG_FORMAT") {
            match format.to_ascii_lowercase().as_str() {
                "json" => self.log_format = LogFormat::Json,
                "compact" => self.log_format = LogFormat::Compact,
                other => warn!(value = other, "ignoring unknown BIZPLANNER_LOG_FORMAT"),
            }
        }
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        let fail = |reason: String| Err(PipelineError::Config(reason));

        if self.contexts.is_empty() {
            return fail("at least one context must be configured".into());
        }
        let mut seen = HashSet::new();
        for ctx in &self.contexts {
            if !seen.insert(ctx.id) {
                return fail(format!("duplicate context id {}", ctx.id));
            }
            if ctx.name.trim().is_empty() {
                return fail(format!("context {} has an empty name", ctx.id));
            }
        }

        let r = &self.retrieval;
        if !(0.0..=1.0).contains(&r.min_similarity) {
            return fail(format!(
                "retrieval.min_similarity must be within [0, 1], got {}",
                r.min_similarity
            ));
        }
        if r.top_k == 0 {
            return fail("retrieval.top_k must be at least 1".into());
        }
        if r.embedding_dimension == 0 {
            return fail("retrieval.embedding_dimension must be at least 1".into());
        }
        if !(MIN_MINUTES..=MAX_MINUTES).contains(&r.fallback_minutes) {
            return fail(format!(
                "retrieval.fallback_minutes must be within [{MIN_MINUTES}, {MAX_MINUTES}]"
            ));
        }

        let p = &self.pipeline;
        if p.retry_attempts == 0 {
            return fail("pipeline.retry_attempts must be at least 1".into());
        }
        if !(1..=MAX_DEADLINE_SECS).contains(&p.deadline_secs) {
            return fail(format!(
                "pipeline.deadline_secs must be within [1, {MAX_DEADLINE_SECS}], got {}",
                p.deadline_secs
            ));
        }
        let window = self.report.completion_window_days;
        if !(1..=MAX_COMPLETION_WINDOW_DAYS).contains(&window) {
            return fail(format!(
                "report.completion_window_days must be within [1, {MAX_COMPLETION_WINDOW_DAYS}], got {window}"
            ));
        }

        Ok(())
    }

    // -----------------------------------------------------------------------
    // Derived settings
    // -----------------------------------------------------------------------

    pub fn context_ids(&self) -> Vec<ContextId> {
        self.contexts.iter().map(|c| ContextId(c.id)).collect()
    }

    /// Display name of a context, or its numeric id when unknown.
    pub fn context_name(&self, id: ContextId) -> String {
        self.contexts
            .iter()
            .find(|c| c.id == id.0)
            .map_or_else(|| id.to_string(), |c| c.name.clone())
    }

    pub fn estimator_config(&self) -> EstimatorConfig {
        EstimatorConfig {
            k: self.retrieval.top_k,
            min_similarity: self.retrieval.min_similarity,
            defaults: CategoryDefaults::default().with_fallback(self.retrieval.fallback_minutes),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(
            self.pipeline.retry_attempts,
            Duration::from_millis(self.pipeline.retry_backoff_ms),
        )
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.pipeline.deadline_secs)
    }

    /// Adapter settings; fails when no API key is configured.
    pub fn openai_config(&self) -> Result<OpenAiConfig> {
        let key = self
            .openai
            .api_key
            .clone()
            .ok_or_else(|| PipelineError::Config("OPENAI_API_KEY is not set".into()))?;

        let mut config = OpenAiConfig::new(key)
            .with_base_url(self.openai.base_url.clone())
            .with_contexts(
                self.contexts
                    .iter()
                    .map(|c| (ContextId(c.id), c.name.clone()))
                    .collect(),
            );
        config.transcription_model = self.openai.transcription_model.clone();
        config.parser_model = self.openai.parser_model.clone();
        config.embedding_model = self.openai.embedding_model.clone();
        config.language = self.openai.language.clone();
        config.timeout = Duration::from_secs(self.openai.timeout_secs);
        Ok(config)
    }
}
