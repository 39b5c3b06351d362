//! Human-readable responses.
//!
//! Everything the requester sees goes through here. Error responses are
//! picked by [`ErrorKind`] and never echo the raw error detail.

use std::fmt::Write as _;

use bizplanner_engine::ErrorKind;
use bizplanner_estimator::{EstimateSource, EstimationResult};
use bizplanner_store::WorkItem;
use chrono::NaiveDateTime;

use crate::config::PlannerConfig;

/// `"1 h 45 min"`, `"2 h"` or `"30 min"`.
pub fn format_minutes(minutes: u32) -> String {
    let (hours, rest) = (minutes / 60, minutes % 60);
    match (hours, rest) {
        (0, m) => format!("{m} min"),
        (h, 0) => format!("{h} h"),
        (h, m) => format!("{h} h {m} min"),
    }
}

pub fn priority_name(priority: u8) -> &'static str {
    match priority {
        1 => "do now",
        2 => "schedule",
        3 => "delegate",
        4 => "backlog",
        _ => "unknown",
    }
}

pub fn format_deadline(deadline: NaiveDateTime) -> String {
    deadline.format("%Y-%m-%d %H:%M").to_string()
}

/// Confirmation shown after a work item was created.
pub fn render_created(
    config: &PlannerConfig,
    item: &WorkItem,
    estimate: &EstimationResult,
    warnings: &[String],
) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Created work item #{}: {}", item.id, item.title);
    let _ = writeln!(out, "Context: {}", config.context_name(item.context_id));
    let _ = writeln!(
        out,
        "Priority: {} ({})",
        item.priority,
        priority_name(item.priority)
    );

    match (item.deadline, &item.deadline_text) {
        (Some(deadline), _) => {
            let _ = writeln!(out, "Deadline: {}", format_deadline(deadline));
        }
        (None, Some(text)) => {
            let _ = writeln!(out, "Deadline: {text}");
        }
        (None, None) => {}
    }
    if let Some(assignee) = &item.assignee_name {
        let _ = writeln!(out, "Assignee: {assignee}");
    }
    if let Some(project) = &item.project {
        let _ = writeln!(out, "Project: {project}");
    }

    let basis = match estimate.source {
        EstimateSource::History => match estimate.neighbor_count {
            1 => "1 similar item".to_string(),
            n => format!("{n} similar items"),
        },
        EstimateSource::Default => "default for this kind of work".to_string(),
    };
    let _ = write!(
        out,
        "Estimate: {} ({} confidence, {basis})",
        format_minutes(estimate.minutes),
        estimate.confidence
    );

    for warning in warnings {
        let _ = write!(out, "\nWarning: {warning}");
    }
    out
}

/// Caller-safe message for a failed request.
///
/// `transcribing` is true when the failure happened before a transcript
/// existed for an audio request.
pub fn error_message(kind: ErrorKind, transcribing: bool) -> &'static str {
    match kind {
        ErrorKind::TransientExternal | ErrorKind::External if transcribing => {
            "Could not transcribe the voice message. Please try again or send text."
        }
        ErrorKind::TransientExternal | ErrorKind::External => {
            "An external service is unavailable right now. Please try again later."
        }
        ErrorKind::Validation => "Could not understand the request. Please rephrase it.",
        ErrorKind::NotFound => "That work item does not exist.",
        ErrorKind::ConstraintViolation => "Could not save the work item.",
        ErrorKind::InvalidTransition => {
            "The work item was already changed by someone else; nothing was updated."
        }
        ErrorKind::IsolationBreach | ErrorKind::Internal => {
            "Something went wrong on our side; the request was not saved."
        }
    }
}

/// One-line summary of an item, used by listings.
pub fn render_item_line(item: &WorkItem) -> String {
    let mut line = format!("#{} [{}] P{} {}", item.id, item.status, item.priority, item.title);
    if let Some(deadline) = item.deadline {
        let _ = write!(line, " (due {})", format_deadline(deadline));
    }
    match (item.estimated_minutes, item.actual_minutes) {
        (Some(est), Some(actual)) => {
            let _ = write!(
                line,
                " est {} / actual {}",
                format_minutes(est),
                format_minutes(actual)
            );
        }
        (Some(est), None) => {
            let _ = write!(line, " est {}", format_minutes(est));
        }
        (None, Some(actual)) => {
            let _ = write!(line, " actual {}", format_minutes(actual));
        }
        (None, None) => {}
    }
    line
}

#[cfg(test)]
mod tests {
    use bizplanner_estimator::Confidence;
    use bizplanner_store::{ContextId, WorkItemStatus};
    use chrono::{NaiveDate, Utc};

    use super::*;

    fn item() -> WorkItem {
        WorkItem {
            id: 12,
            context_id: ContextId(2),
            title: "Calibrate the spectrometer".into(),
            status: WorkItemStatus::Open,
            priority: 1,
            estimated_minutes: Some(105),
            actual_minutes: None,
            embedding: None,
            deadline: NaiveDate::from_ymd_opt(2026, 10, 20).and_then(|d| d.and_hms_opt(18, 0, 0)),
            deadline_text: Some("2026-10-20T18:00".into()),
            assignee_name: Some("Olga".into()),
            project: None,
            requester_id: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    #[test]
    fn minutes_render_compactly() {
        assert_eq!(format_minutes(105), "1 h 45 min");
        assert_eq!(format_minutes(120), "2 h");
        assert_eq!(format_minutes(30), "30 min");
        assert_eq!(format_minutes(480), "8 h");
    }

    #[test]
    fn created_response_lists_fields() {
        let estimate = EstimationResult {
            minutes: 105,
            confidence: Confidence::High,
            neighbor_count: 3,
            source: EstimateSource::History,
        };
        let text = render_created(
            &PlannerConfig::default(),
            &item(),
            &estimate,
            &["transcript may be inaccurate".to_string()],
        );

        assert!(text.starts_with("Created work item #12: Calibrate the spectrometer"));
        assert!(text.contains("Context: Inventum Lab"));
        assert!(text.contains("Priority: 1 (do now)"));
        assert!(text.contains("Deadline: 2026-10-20 18:00"));
        assert!(text.contains("Assignee: Olga"));
        assert!(text.contains("Estimate: 1 h 45 min (high confidence, 3 similar items)"));
        assert!(text.ends_with("Warning: transcript may be inaccurate"));
    }

    #[test]
    fn error_messages_hide_detail() {
        assert!(error_message(ErrorKind::External, true).contains("transcribe"));
        assert!(!error_message(ErrorKind::External, false).contains("transcribe"));
        assert!(error_message(ErrorKind::InvalidTransition, false).contains("already changed"));
    }

    #[test]
    fn item_line_shows_estimate() {
        assert_eq!(
            render_item_line(&item()),
            "#12 [open] P1 Calibrate the spectrometer (due 2026-10-20 18:00) est 1 h 45 min"
        );
    }
}
