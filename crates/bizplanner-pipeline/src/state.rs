//! State carried through one creation run.

use bizplanner_adapters::ParsedRequest;
use bizplanner_engine::{StepError, StepId, WorkflowState};
use bizplanner_estimator::EstimationResult;
use bizplanner_store::WorkItem;
use chrono::NaiveDateTime;

/// What the requester sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawInput {
    /// Encoded voice message, e.g. OGG/Opus.
    Audio { bytes: Vec<u8> },
    Text { text: String },
}

impl RawInput {
    pub fn is_audio(&self) -> bool {
        matches!(self, Self::Audio { .. })
    }
}

/// Fields of [`RequestState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RequestField {
    Input,
    RequesterId,
    RecentContext,
    Text,
    TranscriptConfidence,
    Parsed,
    Deadline,
    Embedding,
    Estimate,
    Item,
    Warnings,
    Response,
}

/// A single-field update produced by a creation step.
#[derive(Debug)]
pub enum RequestValue {
    Text(String),
    TranscriptConfidence(f32),
    Parsed(ParsedRequest),
    Deadline(NaiveDateTime),
    Embedding(Vec<f32>),
    Estimate(EstimationResult),
    Item(WorkItem),
    /// Appended to the warning list rather than replacing it.
    Warning(String),
    Response(String),
}

/// The per-request state bag.
#[derive(Debug, Clone)]
pub struct RequestState {
    pub input: RawInput,
    pub requester_id: Option<String>,
    pub recent_context: Option<String>,
    pub text: Option<String>,
    pub transcript_confidence: Option<f32>,
    pub parsed: Option<ParsedRequest>,
    pub deadline: Option<NaiveDateTime>,
    pub embedding: Option<Vec<f32>>,
    pub estimate: Option<EstimationResult>,
    pub item: Option<WorkItem>,
    pub warnings: Vec<String>,
    pub response: Option<String>,
    pub error: Option<StepError>,
}

impl RequestState {
    pub fn new(input: RawInput) -> Self {
        Self {
            input,
            requester_id: None,
            recent_context: None,
            text: None,
            transcript_confidence: None,
            parsed: None,
            deadline: None,
            embedding: None,
            estimate: None,
            item: None,
            warnings: Vec::new(),
            response: None,
            error: None,
        }
    }

    /// The fields every run starts with.
    pub fn input_fields() -> [RequestField; 3] {
        [
            RequestField::Input,
            RequestField::RequesterId,
            RequestField::RecentContext,
        ]
    }
}

impl WorkflowState for RequestState {
    type Field = RequestField;
    type Value = RequestValue;

    fn field_of(value: &RequestValue) -> RequestField {
        match value {
            RequestValue::Text(_) => RequestField::Text,
            RequestValue::TranscriptConfidence(_) => RequestField::TranscriptConfidence,
            RequestValue::Parsed(_) => RequestField::Parsed,
            RequestValue::Deadline(_) => RequestField::Deadline,
            RequestValue::Embedding(_) => RequestField::Embedding,
            RequestValue::Estimate(_) => RequestField::Estimate,
            RequestValue::Item(_) => RequestField::Item,
            RequestValue::Warning(_) => RequestField::Warnings,
            RequestValue::Response(_) => RequestField::Response,
        }
    }

    fn apply(&mut self, value: RequestValue) {
        match value {
            RequestValue::Text(v) => self.text = Some(v),
            RequestValue::TranscriptConfidence(v) => self.transcript_confidence = Some(v),
            RequestValue::Parsed(v) => self.parsed = Some(v),
            RequestValue::Deadline(v) => self.deadline = Some(v),
            RequestValue::Embedding(v) => self.embedding = Some(v),
            RequestValue::Estimate(v) => self.estimate = Some(v),
            RequestValue::Item(v) => self.item = Some(v),
            RequestValue::Warning(v) => self.warnings.push(v),
            RequestValue::Response(v) => self.response = Some(v),
        }
    }

    fn set_error(&mut self, error: StepError) {
        self.error = Some(error);
    }

    fn error(&self) -> Option<&StepError> {
        self.error.as_ref()
    }

    fn record_degradation(&mut self, step: StepId, _error: &StepError) {
        self.warnings.push(format!(
            "history lookup unavailable ({step}); estimate uses category defaults"
        ));
    }
}
