//! Cron-driven runs of the aggregate report.
//!
//! Expressions are parsed with the `cron` crate, which expects a seconds
//! field; the usual 5-field form is normalized by prepending `0`.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use bizplanner_engine::CancelToken;

use crate::error::{PipelineError, Result};
use crate::report::{Report, ReportPipeline};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Prepend a seconds field to 5-field expressions.
pub fn normalize_cron_expr(expr: &str) -> String {
    if expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.trim().to_string()
    }
}

pub fn parse_schedule(expr: &str) -> Result<cron::Schedule> {
    cron::Schedule::from_str(&normalize_cron_expr(expr))
        .map_err(|e| PipelineError::Config(format!("invalid cron expression `{expr}`: {e}")))
}

// ---------------------------------------------------------------------------
// ReportScheduler
// ---------------------------------------------------------------------------

/// Runs a [`ReportPipeline`] on a cron schedule and hands every report to
/// a callback.
pub struct ReportScheduler {
    expr: String,
    schedule: cron::Schedule,
    stop: CancelToken,
    handle: Option<JoinHandle<()>>,
}

impl ReportScheduler {
    pub fn new(expr: &str) -> Result<Self> {
        Ok(Self {
            expr: expr.to_string(),
            schedule: parse_schedule(expr)?,
            stop: CancelToken::new(),
            handle: None,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expr
    }

    /// Next firing time strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Start the background loop.
    ///
    /// Failed runs are logged and the schedule continues.
    pub fn start<F>(&mut self, pipeline: Arc<ReportPipeline>, on_report: F) -> Result<()>
    where
        F: Fn(Report) + Send + Sync + 'static,
    {
        if self.is_running() {
            return Err(PipelineError::Config("report scheduler is already running".into()));
        }

        self.stop = CancelToken::new();
        let schedule = self.schedule.clone();
        let stop = self.stop.clone();
        let expr = self.expr.clone();

        self.handle = Some(tokio::spawn(async move {
            info!(cron = %expr, "report scheduler started");
            loop {
                let now = Utc::now();
                let Some(next) = schedule.after(&now).next() else {
                    info!(cron = %expr, "schedule has no further occurrences");
                    break;
                };
                let wait = (next - now).to_std().unwrap_or_default();
                debug!(next = %next, "waiting for next report");

                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {}
                }

                match pipeline.run(next).await {
                    Ok(report) => on_report(report),
                    Err(e) => error!(error = %e, "scheduled report failed"),
                }
            }
            info!("report scheduler stopped");
        }));
        Ok(())
    }

    /// Signal the loop to stop and wait for it.
    pub async fn stop(&mut self) {
        self.stop.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                error!(error = %e, "report scheduler task failed");
            }
        }
    }
}
