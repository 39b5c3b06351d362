//! The structured form of a request, as produced by the parser.

use bizplanner_store::ContextId;
use serde::{Deserialize, Serialize};

use crate::error::{AdapterError, Result};

/// Longest accepted title, in characters.
pub const MAX_TITLE_CHARS: usize = 500;
/// Priority used when the parser does not supply one.
pub const DEFAULT_PRIORITY: u8 = 2;

/// A request after structured parsing and validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParsedRequest {
    pub title: String,
    pub context_id: ContextId,
    /// Deadline as phrased, ideally an ISO date or date-time.
    pub deadline_text: Option<String>,
    pub project: Option<String>,
    pub assignee_name: Option<String>,
    /// 1 = do now, 2 = schedule, 3 = delegate, 4 = backlog.
    pub priority: u8,
}

/// Field names accepted from the parsing service.
#[derive(Debug, Deserialize)]
struct WireRequest {
    title: Option<String>,
    #[serde(alias = "business_id")]
    context_id: Option<i64>,
    #[serde(default, alias = "deadline")]
    deadline_text: Option<String>,
    #[serde(default, alias = "project_name")]
    project: Option<String>,
    #[serde(default, alias = "assigned_to_name")]
    assignee_name: Option<String>,
    #[serde(default)]
    priority: Option<i64>,
}

impl ParsedRequest {
    /// Build from the parser's JSON object, validating the shape.
    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        let wire: WireRequest = serde_json::from_value(value)
            .map_err(|e| AdapterError::parse(format!("unexpected parser output: {e}")))?;

        let title = wire
            .title
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| AdapterError::parse("title is missing or empty"))?;
        if title.chars().count() > MAX_TITLE_CHARS {
            return Err(AdapterError::parse(format!(
                "title exceeds {MAX_TITLE_CHARS} characters"
            )));
        }

        let context_id = wire
            .context_id
            .map(ContextId)
            .ok_or_else(|| AdapterError::parse("context id is missing"))?;

        let priority = match wire.priority {
            None => DEFAULT_PRIORITY,
            Some(p @ 1..=4) => p as u8,
            Some(p) => {
                return Err(AdapterError::parse(format!(
                    "priority must be between 1 and 4, got {p}"
                )));
            }
        };

        Ok(Self {
            title,
            context_id,
            deadline_text: non_blank(wire.deadline_text),
            project: non_blank(wire.project),
            assignee_name: non_blank(wire.assignee_name),
            priority,
        })
    }

    /// Reject a context outside the configured set.
    pub fn check_context(&self, known: &[ContextId]) -> Result<()> {
        if known.contains(&self.context_id) {
            Ok(())
        } else {
            Err(AdapterError::parse(format!(
                "unknown context {}",
                self.context_id
            )))
        }
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty() && v != "null")
}
