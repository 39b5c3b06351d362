//! Graph execution.
//!
//! Steps of one run execute sequentially over a state owned by that run;
//! many runs of the same compiled graph may execute concurrently. Detached
//! steps are spawned onto the runtime with their own copy of the state and
//! are not subject to the run's cancellation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::cancel::CancelToken;
use crate::error::StepError;
use crate::state::WorkflowState;
use crate::step::{RetryPolicy, Step, StepDefinition, StepId, StepOutput, Transition};

/// Upper bound on steps executed in one run, guarding against router cycles.
const MAX_TRANSITIONS: usize = 256;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// Reached the end of the graph without an unrecovered error.
    Completed,
    /// An unrecovered step error occurred. The error step, if any, has run.
    Failed,
    /// Cancelled or past its deadline; no further steps were scheduled.
    Cancelled,
}

/// A failure reported by a detached step.
#[derive(Debug, Clone)]
pub struct DetachedFailure {
    pub graph: &'static str,
    pub step: StepId,
    pub error: StepError,
}

/// Final state of a run plus the handles of any detached steps it spawned.
pub struct RunReport<S> {
    pub state: S,
    pub status: RunStatus,
    /// Step ids in execution order, detached steps included.
    pub path: Vec<StepId>,
    pub detached: Vec<JoinHandle<Result<(), StepError>>>,
}

impl<S> RunReport<S> {
    /// Wait for every detached step spawned by this run.
    pub async fn join_detached(&mut self) -> Vec<Result<(), StepError>> {
        join_detached(std::mem::take(&mut self.detached)).await
    }
}

/// Wait for detached step handles, in order. A panicked or aborted task
/// becomes an internal error.
pub async fn join_detached(
    handles: Vec<JoinHandle<Result<(), StepError>>>,
) -> Vec<Result<(), StepError>> {
    futures::future::join_all(handles)
        .await
        .into_iter()
        .map(|joined| {
            joined.unwrap_or_else(|e| Err(StepError::internal(format!("detached task: {e}"))))
        })
        .collect()
}

// ---------------------------------------------------------------------------
// ExecutableGraph
// ---------------------------------------------------------------------------

/// A validated graph, shareable across concurrent runs.
pub struct ExecutableGraph<S: WorkflowState> {
    name: &'static str,
    entry: StepId,
    steps: Vec<StepDefinition<S>>,
    index: HashMap<StepId, usize>,
    deadline: Option<Duration>,
    detached_sink: Option<mpsc::UnboundedSender<DetachedFailure>>,
}

impl<S: WorkflowState> ExecutableGraph<S> {
    pub(crate) fn new(
        name: &'static str,
        entry: StepId,
        steps: Vec<StepDefinition<S>>,
        index: HashMap<StepId, usize>,
        deadline: Option<Duration>,
        detached_sink: Option<mpsc::UnboundedSender<DetachedFailure>>,
    ) -> Self {
        Self {
            name,
            entry,
            steps,
            index,
            deadline,
            detached_sink,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Run to completion with only the graph deadline as a limit.
    pub async fn run(&self, state: S) -> RunReport<S> {
        self.run_with_cancel(state, &CancelToken::new()).await
    }

    /// Run until the graph ends, fails, or `cancel` fires.
    #[instrument(skip_all, fields(graph = self.name))]
    pub async fn run_with_cancel(&self, mut state: S, cancel: &CancelToken) -> RunReport<S> {
        // A deadline too far out to represent is no deadline at all.
        let deadline = self.deadline.and_then(|d| Instant::now().checked_add(d));
        let mut path = Vec::new();
        let mut detached = Vec::new();
        let mut current = Some(self.entry);
        let mut error_routed = false;

        let status = loop {
            let Some(id) = current else {
                break if error_routed {
                    RunStatus::Failed
                } else {
                    RunStatus::Completed
                };
            };

            if cancel.is_cancelled() || deadline.is_some_and(|d| Instant::now() >= d) {
                info!(next_step = id, "run cancelled");
                break RunStatus::Cancelled;
            }
            if path.len() >= MAX_TRANSITIONS {
                error!(limit = MAX_TRANSITIONS, "run exceeded transition limit");
                state.set_error(StepError::internal("transition limit exceeded"));
                break RunStatus::Failed;
            }

            let def = &self.steps[self.index[id]];
            path.push(id);

            if def.detached {
                detached.push(self.spawn_detached(def, &state));
                match self.next_step(def, &state) {
                    Ok(next) => {
                        current = next;
                        continue;
                    }
                    Err(err) => {
                        error!(step = id, error = %err, "routing after detached step failed");
                        state.set_error(err);
                        break RunStatus::Failed;
                    }
                }
            }

            let outcome = if def.uninterruptible {
                Some(run_with_retry(id, def.step.as_ref(), def.retry, &state).await)
            } else {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    _ = deadline_elapsed(deadline) => None,
                    result = run_with_retry(id, def.step.as_ref(), def.retry, &state) => Some(result),
                }
            };
            let Some(result) = outcome else {
                info!(step = id, "run cancelled while step was in flight");
                break RunStatus::Cancelled;
            };

            let result = result
                .and_then(|values| merge(def, &mut state, values))
                .and_then(|()| self.next_step(def, &state));

            let err = match result {
                Ok(next) => {
                    current = next;
                    continue;
                }
                Err(err) => err,
            };

            if error_routed {
                error!(step = id, error = %err, "error step failed");
                break RunStatus::Failed;
            }

            if err.is_transient() {
                if let Some(fallback) = def.fallback {
                    warn!(step = id, error = %err, fallback, "retries exhausted, degrading");
                    state.record_degradation(id, &err);
                    current = Some(fallback);
                    continue;
                }
            }

            error!(step = id, kind = %err.kind, detail = %err.detail, "step failed");
            state.set_error(err);
            match def.on_error {
                Some(error_step) => {
                    error_routed = true;
                    current = Some(error_step);
                }
                None => break RunStatus::Failed,
            }
        };

        debug!(?status, steps = path.len(), "run finished");
        RunReport {
            state,
            status,
            path,
            detached,
        }
    }

    fn next_step(&self, def: &StepDefinition<S>, state: &S) -> Result<Option<StepId>, StepError> {
        match &def.transition {
            Transition::End => Ok(None),
            Transition::Goto(next) => Ok(Some(*next)),
            Transition::Route { targets, router } => {
                let chosen = router(state);
                if targets.contains(&chosen) {
                    debug!(step = def.id, chosen, "routed");
                    Ok(Some(chosen))
                } else {
                    Err(StepError::internal(format!(
                        "router on `{}` chose undeclared step `{chosen}`",
                        def.id
                    )))
                }
            }
        }
    }

    fn spawn_detached(
        &self,
        def: &StepDefinition<S>,
        state: &S,
    ) -> JoinHandle<Result<(), StepError>> {
        let step = Arc::clone(&def.step);
        let snapshot = state.clone();
        let id = def.id;
        let policy = def.retry;
        let graph = self.name;
        let sink = self.detached_sink.clone();

        debug!(step = id, "spawning detached step");
        tokio::spawn(async move {
            match run_with_retry(id, step.as_ref(), policy, &snapshot).await {
                Ok(_) => {
                    debug!(graph, step = id, "detached step finished");
                    Ok(())
                }
                Err(error) => {
                    warn!(graph, step = id, %error, "detached step failed");
                    if let Some(sink) = sink {
                        let _ = sink.send(DetachedFailure {
                            graph,
                            step: id,
                            error: error.clone(),
                        });
                    }
                    Err(error)
                }
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Merge a step's output, rejecting writes to fields it did not declare.
fn merge<S: WorkflowState>(
    def: &StepDefinition<S>,
    state: &mut S,
    values: StepOutput<S>,
) -> Result<(), StepError> {
    if let Some(stray) = values
        .iter()
        .map(S::field_of)
        .find(|field| !def.produces.contains(field))
    {
        return Err(StepError::internal(format!(
            "step `{}` wrote undeclared field {stray:?}",
            def.id
        )));
    }
    for value in values {
        state.apply(value);
    }
    Ok(())
}

/// Run a step, retrying transient failures in place with the same snapshot.
async fn run_with_retry<S: WorkflowState>(
    id: StepId,
    step: &dyn Step<S>,
    policy: RetryPolicy,
    state: &S,
) -> Result<StepOutput<S>, StepError> {
    let mut delay = policy.initial_backoff;
    let mut attempt = 1;
    loop {
        debug!(step = id, attempt, max_attempts = policy.max_attempts, "step attempt");
        match step.run(state).await {
            Ok(output) => return Ok(output),
            Err(err) if err.is_transient() && attempt < policy.max_attempts => {
                warn!(step = id, attempt, error = %err, delay = ?delay, "transient failure, retrying");
                tokio::time::sleep(delay).await;
                delay = policy.next_delay(delay);
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

async fn deadline_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
