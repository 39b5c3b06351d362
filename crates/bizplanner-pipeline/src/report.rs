//! The periodic aggregate report: `load_items -> summarize -> format_report`.
//!
//! Each context is queried on its own and every returned row is checked
//! against the context it was loaded for.

use std::cmp::Ordering;
use std::fmt::Write as _;
use std::sync::Arc;

use async_trait::async_trait;
use bizplanner_engine::{
    ErrorKind, ExecutableGraph, GraphBuilder, RunStatus, Step, StepDefinition, StepError,
    StepOutput, WorkflowState, step_fn,
};
use bizplanner_store::{ContextId, WorkItem, WorkItemStore};
use chrono::{DateTime, Duration, Utc};
use tracing::{error, info};

use crate::config::PlannerConfig;
use crate::error::{PipelineError, Result, store_error};
use crate::format::{error_message, format_deadline, format_minutes, priority_name};

/// Priority excluded from the report.
pub const BACKLOG_PRIORITY: u8 = 4;

// ═══════════════════════════════════════════════════════════════════════
//  State
// ═══════════════════════════════════════════════════════════════════════

/// Items of one context as loaded for a report.
#[derive(Debug, Clone)]
pub struct ContextItems {
    pub context_id: ContextId,
    /// Open, non-backlog items in report order.
    pub open: Vec<WorkItem>,
    /// Items completed within the trailing window.
    pub completed: Vec<WorkItem>,
}

/// Aggregates for one context.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextSummary {
    pub context_id: ContextId,
    pub open_count: usize,
    pub overdue_count: usize,
    pub open_estimated_minutes: u32,
    pub completed_count: usize,
    pub completed_minutes: u32,
    /// Mean estimation accuracy of completed items that had an estimate.
    pub mean_accuracy: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ReportField {
    Contexts,
    AsOf,
    Groups,
    Summaries,
    Rendered,
}

#[derive(Debug)]
pub enum ReportValue {
    Groups(Vec<ContextItems>),
    Summaries(Vec<ContextSummary>),
    Rendered(String),
}

#[derive(Debug, Clone)]
pub struct ReportState {
    pub contexts: Vec<ContextId>,
    pub as_of: DateTime<Utc>,
    pub groups: Option<Vec<ContextItems>>,
    pub summaries: Option<Vec<ContextSummary>>,
    pub rendered: Option<String>,
    pub error: Option<StepError>,
}

impl WorkflowState for ReportState {
    type Field = ReportField;
    type Value = ReportValue;

    fn field_of(value: &ReportValue) -> ReportField {
        match value {
            ReportValue::Groups(_) => ReportField::Groups,
            ReportValue::Summaries(_) => ReportField::Summaries,
            ReportValue::Rendered(_) => ReportField::Rendered,
        }
    }

    fn apply(&mut self, value: ReportValue) {
        match value {
            ReportValue::Groups(v) => self.groups = Some(v),
            ReportValue::Summaries(v) => self.summaries = Some(v),
            ReportValue::Rendered(v) => self.rendered = Some(v),
        }
    }

    fn set_error(&mut self, error: StepError) {
        self.error = Some(error);
    }

    fn error(&self) -> Option<&StepError> {
        self.error.as_ref()
    }
}

type StepResult = std::result::Result<StepOutput<ReportState>, StepError>;

// ═══════════════════════════════════════════════════════════════════════
//  Pipeline
// ═══════════════════════════════════════════════════════════════════════

/// A rendered report and the data behind it.
#[derive(Debug, Clone)]
pub struct Report {
    pub as_of: DateTime<Utc>,
    pub groups: Vec<ContextItems>,
    pub summaries: Vec<ContextSummary>,
    pub rendered: String,
}

/// Runs the report workflow over every configured context.
pub struct ReportPipeline {
    graph: ExecutableGraph<ReportState>,
    contexts: Vec<ContextId>,
}

impl ReportPipeline {
    pub fn new(config: Arc<PlannerConfig>, store: WorkItemStore) -> Result<Self> {
        let days = config.report.completion_window_days;
        let window = Duration::try_days(days)
            .ok_or_else(|| PipelineError::Config(format!("completion window of {days} days")))?;
        let contexts = config.context_ids();
        let render_config = Arc::clone(&config);

        let graph = GraphBuilder::<ReportState>::new("aggregate_report")
            .inputs([ReportField::Contexts, ReportField::AsOf])
            .entry("load_items")
            .error_step("format_error")
            .step(
                StepDefinition::new("load_items", LoadItems { store, window })
                    .requires([ReportField::Contexts, ReportField::AsOf])
                    .produces([ReportField::Groups])
                    .retry(config.retry_policy())
                    .then("summarize"),
            )
            .step(
                StepDefinition::new("summarize", step_fn(summarize))
                    .requires([ReportField::Groups, ReportField::AsOf])
                    .produces([ReportField::Summaries])
                    .then("format_report"),
            )
            .step(
                StepDefinition::new(
                    "format_report",
                    step_fn(move |s: ReportState| {
                        let config = Arc::clone(&render_config);
                        async move {
                            let (Some(groups), Some(summaries)) = (&s.groups, &s.summaries) else {
                                return Err(StepError::internal("report data missing from state"));
                            };
                            Ok(vec![ReportValue::Rendered(render_report(
                                &config, s.as_of, groups, summaries,
                            ))])
                        }
                    }),
                )
                .requires([ReportField::Groups, ReportField::Summaries])
                .produces([ReportField::Rendered]),
            )
            .step(
                StepDefinition::new(
                    "format_error",
                    step_fn(|s: ReportState| async move {
                        let kind = s.error.as_ref().map_or(ErrorKind::Internal, |e| e.kind);
                        Ok(vec![ReportValue::Rendered(format!(
                            "Report unavailable. {}",
                            error_message(kind, false)
                        ))])
                    }),
                )
                .produces([ReportField::Rendered]),
            )
            .compile()?;

        Ok(Self { graph, contexts })
    }

    /// Build the report as of `as_of`.
    pub async fn run(&self, as_of: DateTime<Utc>) -> Result<Report> {
        let state = ReportState {
            contexts: self.contexts.clone(),
            as_of,
            groups: None,
            summaries: None,
            rendered: None,
            error: None,
        };

        let report = self.graph.run(state).await;
        let state = report.state;
        match (report.status, state.groups, state.summaries, state.rendered) {
            (RunStatus::Completed, Some(groups), Some(summaries), Some(rendered)) => {
                info!(contexts = groups.len(), "report generated");
                Ok(Report {
                    as_of,
                    groups,
                    summaries,
                    rendered,
                })
            }
            (_, _, _, rendered) => {
                let error = state
                    .error
                    .unwrap_or_else(|| StepError::internal("report run did not complete"));
                let message = rendered.unwrap_or_else(|| error_message(error.kind, false).into());
                Err(PipelineError::Rejected { message, error })
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Steps
// ═══════════════════════════════════════════════════════════════════════

struct LoadItems {
    store: WorkItemStore,
    window: Duration,
}

#[async_trait]
impl Step<ReportState> for LoadItems {
    async fn run(&self, state: &ReportState) -> StepResult {
        let since = state
            .as_of
            .checked_sub_signed(self.window)
            .ok_or_else(|| {
                StepError::validation("completion window starts before the earliest date")
            })?;
        let mut groups = Vec::with_capacity(state.contexts.len());

        for &context_id in &state.contexts {
            let open = self
                .store
                .list_open_by_context(context_id)
                .await
                .map_err(|e| store_error(&e))?;
            let completed = self
                .store
                .list_completed_between(context_id, since, state.as_of)
                .await
                .map_err(|e| store_error(&e))?;

            if let Some(stray) = open.iter().chain(&completed).find(|i| i.context_id != context_id) {
                error!(
                    expected = %context_id,
                    found = %stray.context_id,
                    item_id = stray.id,
                    "report query crossed context boundary"
                );
                return Err(StepError::isolation_breach(format!(
                    "report for context {context_id} loaded item {} from context {}",
                    stray.id, stray.context_id
                )));
            }

            let mut open: Vec<WorkItem> = open
                .into_iter()
                .filter(|i| i.priority != BACKLOG_PRIORITY)
                .collect();
            open.sort_by(report_order);

            groups.push(ContextItems {
                context_id,
                open,
                completed,
            });
        }

        Ok(vec![ReportValue::Groups(groups)])
    }
}

async fn summarize(state: ReportState) -> StepResult {
    let groups = state
        .groups
        .as_ref()
        .ok_or_else(|| StepError::internal("groups missing from report state"))?;
    let now = state.as_of.naive_utc();

    let summaries = groups
        .iter()
        .map(|group| {
            let accuracies: Vec<f64> = group
                .completed
                .iter()
                .filter_map(WorkItem::estimation_accuracy)
                .collect();
            ContextSummary {
                context_id: group.context_id,
                open_count: group.open.len(),
                overdue_count: group
                    .open
                    .iter()
                    .filter(|i| i.deadline.is_some_and(|d| d < now))
                    .count(),
                open_estimated_minutes: group.open.iter().filter_map(|i| i.estimated_minutes).sum(),
                completed_count: group.completed.len(),
                completed_minutes: group.completed.iter().filter_map(|i| i.actual_minutes).sum(),
                mean_accuracy: (!accuracies.is_empty())
                    .then(|| accuracies.iter().sum::<f64>() / accuracies.len() as f64),
            }
        })
        .collect();

    Ok(vec![ReportValue::Summaries(summaries)])
}

/// Deadline first (undated last), then priority, then id.
pub fn report_order(a: &WorkItem, b: &WorkItem) -> Ordering {
    match (a.deadline, b.deadline) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
    .then(a.priority.cmp(&b.priority))
    .then(a.id.cmp(&b.id))
}

fn render_report(
    config: &PlannerConfig,
    as_of: DateTime<Utc>,
    groups: &[ContextItems],
    summaries: &[ContextSummary],
) -> String {
    let mut out = format!("Work report {}", as_of.format("%Y-%m-%d %H:%M UTC"));
    let window = config.report.completion_window_days;

    for (group, summary) in groups.iter().zip(summaries) {
        let _ = write!(out, "\n\n== {} ==", config.context_name(group.context_id));
        let _ = write!(
            out,
            "\nOpen: {} ({} overdue, {} estimated)",
            summary.open_count,
            summary.overdue_count,
            format_minutes(summary.open_estimated_minutes)
        );
        for item in &group.open {
            let _ = write!(out, "\n  - {} [{}]", item.title, priority_name(item.priority));
            if let Some(deadline) = item.deadline {
                let _ = write!(out, " due {}", format_deadline(deadline));
            }
            if let Some(assignee) = &item.assignee_name {
                let _ = write!(out, " -> {assignee}");
            }
        }

        let _ = write!(
            out,
            "\nCompleted in the last {window} days: {} ({})",
            summary.completed_count,
            format_minutes(summary.completed_minutes)
        );
        if let Some(accuracy) = summary.mean_accuracy {
            let _ = write!(out, ", estimate accuracy {:.0}%", accuracy * 100.0);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use bizplanner_store::WorkItemStatus;
    use chrono::NaiveDate;

    use super::*;

    fn item(id: i64, priority: u8, deadline_day: Option<u32>) -> WorkItem {
        WorkItem {
            id,
            context_id: ContextId(1),
            title: format!("item {id}"),
            status: WorkItemStatus::Open,
            priority,
            estimated_minutes: Some(30),
            actual_minutes: None,
            embedding: None,
            deadline: deadline_day
                .and_then(|d| NaiveDate::from_ymd_opt(2026, 10, d))
                .and_then(|d| d.and_hms_opt(12, 0, 0)),
            deadline_text: None,
            assignee_name: None,
            project: None,
            requester_id: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    #[test]
    fn order_is_deadline_then_priority() {
        let mut items = vec![
            item(1, 1, None),
            item(2, 3, Some(20)),
            item(3, 1, Some(20)),
            item(4, 2, Some(18)),
        ];
        items.sort_by(report_order);
        let ids: Vec<_> = items.iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![4, 3, 2, 1]);
    }

    #[tokio::test]
    async fn summary_counts_overdue_and_accuracy() {
        let as_of = NaiveDate::from_ymd_opt(2026, 10, 19)
            .and_then(|d| d.and_hms_opt(8, 0, 0))
            .unwrap()
            .and_utc();

        let mut done = item(9, 2, None);
        done.status = WorkItemStatus::Done;
        done.estimated_minutes = Some(60);
        done.actual_minutes = Some(50);

        let state = ReportState {
            contexts: vec![ContextId(1)],
            as_of,
            groups: Some(vec![ContextItems {
                context_id: ContextId(1),
                open: vec![item(1, 1, Some(18)), item(2, 2, Some(25)), item(3, 2, None)],
                completed: vec![done],
            }]),
            summaries: None,
            rendered: None,
            error: None,
        };

        let out = summarize(state).await.unwrap();
        let [ReportValue::Summaries(summaries)] = &out[..] else {
            panic!("unexpected output: {out:?}");
        };
        let s = &summaries[0];
        assert_eq!(s.open_count, 3);
        assert_eq!(s.overdue_count, 1);
        assert_eq!(s.open_estimated_minutes, 90);
        assert_eq!(s.completed_count, 1);
        assert_eq!(s.completed_minutes, 50);
        assert!((s.mean_accuracy.unwrap() - 0.8).abs() < 1e-9);
    }
}
