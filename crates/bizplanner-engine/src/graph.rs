//! Graph declaration and static validation.
//!
//! [`GraphBuilder::compile`] checks the whole graph before anything runs:
//! every referenced step exists, routers declare their targets, every
//! step is reachable, and every required input field is available on
//! *every* path from the entry step (a must-reach data-flow analysis).
//! Outputs of detached steps never count as available, and a failure
//! edge (error step or fallback) carries only what was available before
//! the failing step ran.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{Result, SchemaError};
use crate::runner::{DetachedFailure, ExecutableGraph};
use crate::state::WorkflowState;
use crate::step::{StepDefinition, StepId};


/// Collects step definitions and compiles them into an [`ExecutableGraph`].
pub struct GraphBuilder<S: WorkflowState> {
    name: &'static str,
    inputs: Vec<S::Field>,
    entry: Option<StepId>,
    steps: Vec<StepDefinition<S>>,
    default_error_step: Option<StepId>,
    deadline: Option<Duration>,
    detached_sink: Option<mpsc::UnboundedSender<DetachedFailure>>,
}

impl<S: WorkflowState> GraphBuilder<S> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            inputs: Vec::new(),
            entry: None,
            steps: Vec::new(),
            default_error_step: None,
            deadline: None,
            detached_sink: None,
        }
    }

    /// Fields populated before the run starts.
    pub fn inputs(mut self, fields: impl IntoIterator<Item = S::Field>) -> Self {
        self.inputs = fields.into_iter().collect();
        self
    }

    pub fn entry(mut self, step: StepId) -> Self {
        self.entry = Some(step);
        self
    }

    pub fn step(mut self, definition: StepDefinition<S>) -> Self {
        self.steps.push(definition);
        self
    }

    /// Error step for every attached step that does not name its own.
    pub fn error_step(mut self, step: StepId) -> Self {
        self.default_error_step = Some(step);
        self
    }

    /// Overall run deadline; on expiry no further steps are scheduled.
    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Channel receiving every detached-step failure.
    pub fn detached_errors(mut self, sink: mpsc::UnboundedSender<DetachedFailure>) -> Self {
        self.detached_sink = Some(sink);
        self
    }

    /// Validate the graph and freeze it for execution.
    pub fn compile(mut self) -> Result<ExecutableGraph<S>> {
        let entry = self
            .entry
            .ok_or(SchemaError::MissingEntry { graph: self.name })?;

        let mut index = HashMap::with_capacity(self.steps.len());
        for (i, def) in self.steps.iter().enumerate() {
            if index.insert(def.id, i).is_some() {
                return Err(SchemaError::DuplicateStep { step: def.id });
            }
        }

        if !index.contains_key(entry) {
            return Err(SchemaError::UnknownStep {
                step: self.name,
                target: entry,
            });
        }

        if let Some(error_step) = self.default_error_step {
            if !index.contains_key(error_step) {
                return Err(SchemaError::UnknownStep {
                    step: self.name,
                    target: error_step,
                });
            }
            for def in &mut self.steps {
                if def.on_error.is_none() && !def.detached && def.id != error_step {
                    def.on_error = Some(error_step);
                }
            }
        }

        for def in &self.steps {
            validate_step(def, &index)?;
        }

        let entry_idx = index[entry];
        check_reachable(entry_idx, &self.steps, &index)?;
        check_availability(&self.inputs, entry_idx, &self.steps, &index)?;

        debug!(graph = self.name, steps = self.steps.len(), "graph compiled");

        Ok(ExecutableGraph::new(
            self.name,
            entry,
            self.steps,
            index,
            self.deadline,
            self.detached_sink,
        ))
    }
}

// ---------------------------------------------------------------------------
// Validation passes
// ---------------------------------------------------------------------------

fn validate_step<S: WorkflowState>(
    def: &StepDefinition<S>,
    index: &HashMap<StepId, usize>,
) -> Result<()> {
    if let crate::step::Transition::Route { targets, .. } = &def.transition {
        if targets.is_empty() {
            return Err(SchemaError::EmptyRoute { step: def.id });
        }
    }

    let referenced = def
        .transition
        .targets()
        .into_iter()
        .chain(def.on_error)
        .chain(def.fallback);
    for target in referenced {
        if !index.contains_key(target) {
            return Err(SchemaError::UnknownStep {
                step: def.id,
                target,
            });
        }
    }

    let retry = def.retry;
    if retry.max_attempts == 0 {
        return Err(SchemaError::InvalidRetry {
            step: def.id,
            reason: "max_attempts must be at least 1".into(),
        });
    }
    if !retry.backoff_factor.is_finite() || retry.backoff_factor < 1.0 {
        return Err(SchemaError::InvalidRetry {
            step: def.id,
            reason: format!("backoff factor {} must be >= 1", retry.backoff_factor),
        });
    }

    Ok(())
}

/// An edge in the step graph. `carries_outputs` is false for failure
/// edges and for edges leaving a detached step.
struct Edge {
    from: usize,
    to: usize,
    carries_outputs: bool,
}

fn edges<S: WorkflowState>(steps: &[StepDefinition<S>], index: &HashMap<StepId, usize>) -> Vec<Edge> {
    let mut edges = Vec::new();
    for (from, def) in steps.iter().enumerate() {
        for target in def.transition.targets() {
            edges.push(Edge {
                from,
                to: index[target],
                carries_outputs: !def.detached,
            });
        }
        for target in def.on_error.into_iter().chain(def.fallback) {
            edges.push(Edge {
                from,
                to: index[target],
                carries_outputs: false,
            });
        }
    }
    edges
}

fn check_reachable<S: WorkflowState>(
    entry: usize,
    steps: &[StepDefinition<S>],
    index: &HashMap<StepId, usize>,
) -> Result<()> {
    let edges = edges(steps, index);
    let mut seen = vec![false; steps.len()];
    let mut queue = VecDeque::from([entry]);
    seen[entry] = true;

    while let Some(node) = queue.pop_front() {
        for edge in edges.iter().filter(|e| e.from == node) {
            if !seen[edge.to] {
                seen[edge.to] = true;
                queue.push_back(edge.to);
            }
        }
    }

    match seen.iter().position(|reached| !reached) {
        Some(i) => Err(SchemaError::Unreachable { step: steps[i].id }),
        None => Ok(()),
    }
}

/// Must-reach availability: a field is available on entry to a step only
/// if every incoming edge carries it.
fn check_availability<S: WorkflowState>(
    inputs: &[S::Field],
    entry: usize,
    steps: &[StepDefinition<S>],
    index: &HashMap<StepId, usize>,
) -> Result<()> {
    let inputs: BTreeSet<S::Field> = inputs.iter().copied().collect();
    let universe: BTreeSet<S::Field> = inputs
        .iter()
        .copied()
        .chain(steps.iter().flat_map(|d| d.requires.iter().copied()))
        .chain(steps.iter().flat_map(|d| d.produces.iter().copied()))
        .collect();

    let edges = edges(steps, index);
    let mut available: Vec<BTreeSet<S::Field>> = vec![universe.clone(); steps.len()];
    available[entry] = inputs.clone();

    loop {
        let mut changed = false;
        for node in 0..steps.len() {
            let mut acc: Option<BTreeSet<S::Field>> = (node == entry).then(|| inputs.clone());
            for edge in edges.iter().filter(|e| e.to == node) {
                let mut carried = available[edge.from].clone();
                if edge.carries_outputs {
                    carried.extend(steps[edge.from].produces.iter().copied());
                }
                acc = Some(match acc {
                    None => carried,
                    Some(so_far) => so_far.intersection(&carried).copied().collect(),
                });
            }
            let next = acc.unwrap_or_else(|| universe.clone());
            if next != available[node] {
                available[node] = next;
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    for (i, def) in steps.iter().enumerate() {
        if let Some(missing) = def.requires.iter().find(|f| !available[i].contains(f)) {
            return Err(SchemaError::MissingInput {
                step: def.id,
                field: format!("{missing:?}"),
            });
        }
    }
    Ok(())
}
