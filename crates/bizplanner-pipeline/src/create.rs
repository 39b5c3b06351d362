//! The work item creation workflow.
//!
//! ```text
//! intake ─┬─> transcribe ─┐
//!         └───────────────┴─> parse -> embed -> estimate -> persist
//!                                 │         └──(degraded)──┐    │
//!                                 └────(degraded)──> default_estimate
//! persist -> backfill_embedding (detached) -> format_response
//! any failure -> format_error
//! ```
//!
//! The estimate uses an embedding computed synchronously in `embed`. The
//! durable embedding that makes the item a future neighbour is recomputed
//! by the detached `backfill_embedding` step after the item is saved.

use std::sync::Arc;

use async_trait::async_trait;
use bizplanner_adapters::{EmbeddingGenerator, StructuredParser, Transcriber};
use bizplanner_engine::{
    CancelToken, DetachedFailure, ErrorKind, ExecutableGraph, GraphBuilder, RunStatus, Step,
    StepDefinition, StepError, StepOutput, join_detached, step_fn,
};
use bizplanner_estimator::{DurationEstimator, EstimationResult};
use bizplanner_store::{ContextId, NewWorkItem, WorkItem, WorkItemStore};
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::config::PlannerConfig;
use crate::error::{PipelineError, Result, adapter_error, estimator_error, store_error};
use crate::format::{error_message, render_created};
use crate::state::{RawInput, RequestField as F, RequestState, RequestValue as V};

/// Longest accepted text request, in characters.
pub const MAX_TEXT_CHARS: usize = 4_000;

type StepResult = std::result::Result<StepOutput<RequestState>, StepError>;

// ═══════════════════════════════════════════════════════════════════════
//  Public API
// ═══════════════════════════════════════════════════════════════════════

/// External collaborators used by the creation workflow.
#[derive(Clone)]
pub struct Services {
    pub transcriber: Arc<dyn Transcriber>,
    pub parser: Arc<dyn StructuredParser>,
    pub embedder: Arc<dyn EmbeddingGenerator>,
}

/// One inbound creation request.
#[derive(Debug, Clone)]
pub struct CreateRequest {
    pub raw_input: RawInput,
    pub requester_id: Option<String>,
    /// Recent conversation handed to the parser for disambiguation.
    pub recent_context: Option<String>,
}

impl CreateRequest {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            raw_input: RawInput::Text { text: text.into() },
            requester_id: None,
            recent_context: None,
        }
    }

    pub fn audio(bytes: Vec<u8>) -> Self {
        Self {
            raw_input: RawInput::Audio { bytes },
            requester_id: None,
            recent_context: None,
        }
    }

    pub fn with_requester(mut self, requester_id: impl Into<String>) -> Self {
        self.requester_id = Some(requester_id.into());
        self
    }

    pub fn with_recent_context(mut self, recent_context: impl Into<String>) -> Self {
        self.recent_context = Some(recent_context.into());
        self
    }
}

/// Result of a successful creation.
#[derive(Debug)]
pub struct CreateOutcome {
    pub item: WorkItem,
    pub estimation: EstimationResult,
    pub warnings: Vec<String>,
    /// Text to send back to the requester.
    pub response: String,
    /// Detached follow-up work (the embedding backfill) still in flight.
    pub background: Vec<JoinHandle<std::result::Result<(), StepError>>>,
}

impl CreateOutcome {
    /// Wait for the detached follow-up work of this request.
    pub async fn join_background(&mut self) -> Vec<std::result::Result<(), StepError>> {
        join_detached(std::mem::take(&mut self.background)).await
    }
}

/// `CreateWorkItem(raw_input) -> {item, estimation, warnings}`.
pub struct CreateWorkItem {
    graph: ExecutableGraph<RequestState>,
    config: Arc<PlannerConfig>,
}

impl CreateWorkItem {
    /// Build and compile the creation graph.
    pub fn new(
        config: Arc<PlannerConfig>,
        services: Services,
        store: WorkItemStore,
        estimator: DurationEstimator,
        detached_errors: Option<mpsc::UnboundedSender<DetachedFailure>>,
    ) -> Result<Self> {
        let graph = build_graph(&config, services, store, estimator, detached_errors)?;
        Ok(Self { graph, config })
    }

    pub fn graph(&self) -> &ExecutableGraph<RequestState> {
        &self.graph
    }

    pub async fn run(&self, request: CreateRequest) -> Result<CreateOutcome> {
        self.run_with_cancel(request, &CancelToken::new()).await
    }

    /// Run the workflow; `cancel` stops it between steps.
    ///
    /// A run cancelled after the item was saved still succeeds: the item
    /// exists with its estimate, only the embedding backfill is skipped.
    pub async fn run_with_cancel(
        &self,
        request: CreateRequest,
        cancel: &CancelToken,
    ) -> Result<CreateOutcome> {
        let mut state = RequestState::new(request.raw_input);
        state.requester_id = request.requester_id;
        state.recent_context = request.recent_context;

        let run_id = uuid::Uuid::now_v7();
        let span = info_span!("create_work_item", %run_id, audio = state.input.is_audio());
        let report = self
            .graph
            .run_with_cancel(state, cancel)
            .instrument(span)
            .await;
        let background = report.detached;
        let state = report.state;

        match (report.status, saved(&state)) {
            (RunStatus::Completed | RunStatus::Cancelled, Some((item, estimation))) => {
                if report.status == RunStatus::Cancelled {
                    info!(item_id = item.id, "run cancelled after the item was saved");
                }
                let response = state.response.clone().unwrap_or_else(|| {
                    render_created(&self.config, &item, &estimation, &state.warnings)
                });
                Ok(CreateOutcome {
                    item,
                    estimation,
                    warnings: state.warnings,
                    response,
                    background,
                })
            }
            (RunStatus::Cancelled, None) => Err(PipelineError::Cancelled),
            (RunStatus::Completed, None) => Err(PipelineError::Rejected {
                message: error_message(ErrorKind::Internal, false).to_string(),
                error: StepError::internal("run completed without saving an item"),
            }),
            (RunStatus::Failed, _) => {
                let error = state
                    .error
                    .clone()
                    .unwrap_or_else(|| StepError::internal("run failed without an error"));
                let message = state.response.clone().unwrap_or_else(|| {
                    error_message(error.kind, transcribing(&state)).to_string()
                });
                Err(PipelineError::Rejected { message, error })
            }
        }
    }
}

fn saved(state: &RequestState) -> Option<(WorkItem, EstimationResult)> {
    Some((state.item.clone()?, state.estimate.clone()?))
}

fn transcribing(state: &RequestState) -> bool {
    state.input.is_audio() && state.text.is_none()
}

// ═══════════════════════════════════════════════════════════════════════
//  Graph
// ═══════════════════════════════════════════════════════════════════════

fn build_graph(
    config: &Arc<PlannerConfig>,
    services: Services,
    store: WorkItemStore,
    estimator: DurationEstimator,
    detached_errors: Option<mpsc::UnboundedSender<DetachedFailure>>,
) -> Result<ExecutableGraph<RequestState>> {
    let retry = config.retry_policy();
    let dimension = config.retrieval.embedding_dimension;

    let default_estimator = estimator.clone();
    let response_config = Arc::clone(config);

    let mut builder = GraphBuilder::<RequestState>::new("create_work_item")
        .inputs(RequestState::input_fields())
        .entry("intake")
        .error_step("format_error")
        .deadline(config.deadline())
        .step(
            StepDefinition::new("intake", step_fn(intake))
                .requires([F::Input])
                .produces([F::Text])
                .route(["transcribe", "parse"], |s: &RequestState| {
                    if s.input.is_audio() { "transcribe" } else { "parse" }
                }),
        )
        .step(
            StepDefinition::new(
                "transcribe",
                TranscribeStep {
                    transcriber: services.transcriber,
                    low_confidence: config.pipeline.low_confidence_threshold,
                },
            )
            .requires([F::Input])
            .produces([F::Text, F::TranscriptConfidence, F::Warnings])
            .retry(retry)
            .then("parse"),
        )
        .step(
            StepDefinition::new(
                "parse",
                ParseStep {
                    parser: services.parser,
                    contexts: config.context_ids(),
                },
            )
            .requires([F::Text])
            .produces([F::Parsed, F::Deadline, F::Warnings])
            .retry(retry)
            .then("embed"),
        )
        .step(
            StepDefinition::new(
                "embed",
                EmbedStep {
                    embedder: Arc::clone(&services.embedder),
                    dimension,
                },
            )
            .requires([F::Parsed])
            .produces([F::Embedding])
            .retry(retry)
            .then("estimate")
            .fallback("default_estimate"),
        )
        .step(
            StepDefinition::new("estimate", EstimateStep { estimator })
                .requires([F::Parsed, F::Embedding])
                .produces([F::Estimate])
                .retry(retry)
                .then("persist")
                .fallback("default_estimate"),
        )
        .step(
            StepDefinition::new(
                "default_estimate",
                step_fn(move |s: RequestState| {
                    let estimator = default_estimator.clone();
                    async move {
                        let parsed = s.parsed.as_ref().ok_or_else(|| missing("parsed"))?;
                        Ok(vec![V::Estimate(estimator.default_estimate(&parsed.title))])
                    }
                }),
            )
            .requires([F::Parsed])
            .produces([F::Estimate])
            .then("persist"),
        )
        .step(
            StepDefinition::new(
                "persist",
                PersistStep {
                    store: store.clone(),
                },
            )
            .requires([F::Parsed, F::Estimate])
            .produces([F::Item])
            .retry(retry)
            .uninterruptible()
            .then("backfill_embedding"),
        )
        .step(
            StepDefinition::new(
                "backfill_embedding",
                BackfillStep {
                    embedder: services.embedder,
                    store,
                    dimension,
                },
            )
            .requires([F::Item])
            .retry(retry)
            .detached()
            .then("format_response"),
        )
        .step(
            StepDefinition::new(
                "format_response",
                step_fn(move |s: RequestState| {
                    let config = Arc::clone(&response_config);
                    async move {
                        let item = s.item.as_ref().ok_or_else(|| missing("item"))?;
                        let estimate = s.estimate.as_ref().ok_or_else(|| missing("estimate"))?;
                        Ok(vec![V::Response(render_created(
                            &config,
                            item,
                            estimate,
                            &s.warnings,
                        ))])
                    }
                }),
            )
            .requires([F::Item, F::Estimate])
            .produces([F::Response]),
        )
        .step(StepDefinition::new("format_error", step_fn(format_error)).produces([F::Response]));

    if let Some(sink) = detached_errors {
        builder = builder.detached_errors(sink);
    }

    Ok(builder.compile()?)
}

fn missing(field: &str) -> StepError {
    StepError::internal(format!("`{field}` missing from request state"))
}

// ═══════════════════════════════════════════════════════════════════════
//  Steps
// ═══════════════════════════════════════════════════════════════════════

async fn intake(state: RequestState) -> StepResult {
    match &state.input {
        RawInput::Audio { bytes } if bytes.is_empty() => {
            Err(StepError::validation("voice message is empty"))
        }
        RawInput::Audio { bytes } => {
            debug!(bytes = bytes.len(), "audio request");
            Ok(Vec::new())
        }
        RawInput::Text { text } => {
            let text = text.trim();
            if text.is_empty() {
                return Err(StepError::validation("request text is empty"));
            }
            if text.chars().count() > MAX_TEXT_CHARS {
                return Err(StepError::validation(format!(
                    "request text exceeds {MAX_TEXT_CHARS} characters"
                )));
            }
            Ok(vec![V::Text(text.to_owned())])
        }
    }
}

struct TranscribeStep {
    transcriber: Arc<dyn Transcriber>,
    low_confidence: f32,
}

#[async_trait]
impl Step<RequestState> for TranscribeStep {
    async fn run(&self, state: &RequestState) -> StepResult {
        let RawInput::Audio { bytes } = &state.input else {
            return Err(StepError::internal("transcribe called for a text request"));
        };
        let transcript = self
            .transcriber
            .transcribe(bytes)
            .await
            .map_err(|e| adapter_error(&e))?;

        debug!(chars = transcript.text.len(), confidence = transcript.confidence, "transcribed");
        let mut out = vec![
            V::Text(transcript.text),
            V::TranscriptConfidence(transcript.confidence),
        ];
        if transcript.confidence < self.low_confidence {
            warn!(confidence = transcript.confidence, "low transcription confidence");
            out.push(V::Warning(format!(
                "voice message was hard to recognise (confidence {:.2}); please check the title",
                transcript.confidence
            )));
        }
        Ok(out)
    }
}

struct ParseStep {
    parser: Arc<dyn StructuredParser>,
    contexts: Vec<ContextId>,
}

#[async_trait]
impl Step<RequestState> for ParseStep {
    async fn run(&self, state: &RequestState) -> StepResult {
        let text = state.text.as_deref().ok_or_else(|| missing("text"))?;
        let parsed = self
            .parser
            .parse(text, state.recent_context.as_deref())
            .await
            .map_err(|e| adapter_error(&e))?;
        parsed
            .check_context(&self.contexts)
            .map_err(|e| adapter_error(&e))?;

        let mut out = Vec::with_capacity(3);
        if let Some(raw) = &parsed.deadline_text {
            match parse_deadline(raw) {
                Some(deadline) => out.push(V::Deadline(deadline)),
                None => {
                    warn!(deadline = %raw, "could not interpret deadline");
                    out.push(V::Warning(format!(
                        "could not interpret deadline \"{raw}\"; saved as text"
                    )));
                }
            }
        }
        debug!(context_id = %parsed.context_id, priority = parsed.priority, "request parsed");
        out.push(V::Parsed(parsed));
        Ok(out)
    }
}

struct EmbedStep {
    embedder: Arc<dyn EmbeddingGenerator>,
    dimension: usize,
}

#[async_trait]
impl Step<RequestState> for EmbedStep {
    async fn run(&self, state: &RequestState) -> StepResult {
        let parsed = state.parsed.as_ref().ok_or_else(|| missing("parsed"))?;
        let embedding = embed_checked(self.embedder.as_ref(), &parsed.title, self.dimension).await?;
        Ok(vec![V::Embedding(embedding)])
    }
}

struct EstimateStep {
    estimator: DurationEstimator,
}

#[async_trait]
impl Step<RequestState> for EstimateStep {
    async fn run(&self, state: &RequestState) -> StepResult {
        let parsed = state.parsed.as_ref().ok_or_else(|| missing("parsed"))?;
        let embedding = state.embedding.as_deref().ok_or_else(|| missing("embedding"))?;
        let estimate = self
            .estimator
            .estimate(embedding, parsed.context_id, &parsed.title)
            .await
            .map_err(|e| estimator_error(&e))?;
        Ok(vec![V::Estimate(estimate)])
    }
}

struct PersistStep {
    store: WorkItemStore,
}

#[async_trait]
impl Step<RequestState> for PersistStep {
    async fn run(&self, state: &RequestState) -> StepResult {
        let parsed = state.parsed.as_ref().ok_or_else(|| missing("parsed"))?;
        let estimate = state.estimate.as_ref().ok_or_else(|| missing("estimate"))?;

        let mut input = NewWorkItem::new(parsed.context_id, parsed.title.clone());
        input.priority = parsed.priority;
        input.estimated_minutes = Some(estimate.minutes);
        input.deadline = state.deadline;
        input.deadline_text = parsed.deadline_text.clone();
        input.assignee_name = parsed.assignee_name.clone();
        input.project = parsed.project.clone();
        input.requester_id = state.requester_id.clone();

        let item = self.store.create(input).await.map_err(|e| store_error(&e))?;
        info!(
            item_id = item.id,
            context_id = %item.context_id,
            estimated_minutes = estimate.minutes,
            source = ?estimate.source,
            "work item created"
        );
        Ok(vec![V::Item(item)])
    }
}

struct BackfillStep {
    embedder: Arc<dyn EmbeddingGenerator>,
    store: WorkItemStore,
    dimension: usize,
}

#[async_trait]
impl Step<RequestState> for BackfillStep {
    async fn run(&self, state: &RequestState) -> StepResult {
        let item = state.item.as_ref().ok_or_else(|| missing("item"))?;
        let embedding = embed_checked(self.embedder.as_ref(), &item.title, self.dimension).await?;
        self.store
            .update_embedding(item.id, embedding)
            .await
            .map_err(|e| store_error(&e))?;
        debug!(item_id = item.id, "embedding backfilled");
        Ok(Vec::new())
    }
}

async fn format_error(state: RequestState) -> StepResult {
    let kind = state
        .error
        .as_ref()
        .map_or(ErrorKind::Internal, |e| e.kind);
    Ok(vec![V::Response(
        error_message(kind, transcribing(&state)).to_string(),
    )])
}

// ═══════════════════════════════════════════════════════════════════════
//  Helpers
// ═══════════════════════════════════════════════════════════════════════

/// Embed `text` and check the vector length against the configured
/// dimension.
pub(crate) async fn embed_checked(
    embedder: &dyn EmbeddingGenerator,
    text: &str,
    dimension: usize,
) -> std::result::Result<Vec<f32>, StepError> {
    let embedding = embedder.embed(text).await.map_err(|e| adapter_error(&e))?;
    if embedding.len() != dimension {
        return Err(StepError::validation(format!(
            "embedding has {} dimensions, expected {dimension}",
            embedding.len()
        )));
    }
    Ok(embedding)
}

/// Interpret a parser deadline. Date-only values mean the end of that day.
pub fn parse_deadline(text: &str) -> Option<NaiveDateTime> {
    const DATE_TIME_FORMATS: [&str; 4] = [
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M",
    ];

    let text = text.trim();
    if let Some(dt) = DATE_TIME_FORMATS
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(text, f).ok())
    {
        return Some(dt);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.naive_local());
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(23, 59, 59))
}
