//! Step contract and step definitions.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::StepError;
use crate::state::WorkflowState;

/// Step identifier, unique within a graph.
pub type StepId = &'static str;

/// Outcome of a successful step: partial updates to merge.
pub type StepOutput<S> = Vec<<S as WorkflowState>::Value>;

/// Pure routing function choosing the next step from the current state.
///
/// Must not perform I/O; the runner rejects ids outside the declared set.
pub type Router<S> = Arc<dyn Fn(&S) -> StepId + Send + Sync>;

// ---------------------------------------------------------------------------
// Step trait
// ---------------------------------------------------------------------------

/// One unit of work in a graph.
///
/// Receives an immutable snapshot of the state. The same snapshot is
/// passed again on every retry attempt.
#[async_trait]
pub trait Step<S: WorkflowState>: Send + Sync {
    async fn run(&self, state: &S) -> Result<StepOutput<S>, StepError>;
}

/// Adapts an async closure taking an owned state snapshot into a [`Step`].
pub struct FnStep<F, Fut> {
    f: F,
    _marker: PhantomData<fn() -> Fut>,
}

/// Build a step from `|state| async move { ... }`.
pub fn step_fn<S, F, Fut>(f: F) -> FnStep<F, Fut>
where
    S: WorkflowState,
    F: Fn(S) -> Fut + Send + Sync,
    Fut: Future<Output = Result<StepOutput<S>, StepError>> + Send,
{
    FnStep {
        f,
        _marker: PhantomData,
    }
}

#[async_trait]
impl<S, F, Fut> Step<S> for FnStep<F, Fut>
where
    S: WorkflowState,
    F: Fn(S) -> Fut + Send + Sync,
    Fut: Future<Output = Result<StepOutput<S>, StepError>> + Send,
{
    async fn run(&self, state: &S) -> Result<StepOutput<S>, StepError> {
        (self.f)(state.clone()).await
    }
}

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

/// In-place retry with exponential backoff, applied to transient errors only.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Must be at least 1.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    /// Multiplier applied to the delay after each failed attempt.
    pub backoff_factor: f64,
    /// Cap on a single delay.
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Single attempt, no retry.
    pub const fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            backoff_factor: 1.0,
            max_backoff: Duration::ZERO,
        }
    }

    /// `max_attempts` attempts, doubling from `initial_backoff`, capped at 10s.
    pub const fn exponential(max_attempts: u32, initial_backoff: Duration) -> Self {
        Self {
            max_attempts,
            initial_backoff,
            backoff_factor: 2.0,
            max_backoff: Duration::from_secs(10),
        }
    }

    /// Delay to sleep after the given failed delay.
    pub fn next_delay(&self, delay: Duration) -> Duration {
        Duration::from_secs_f64(
            (delay.as_secs_f64() * self.backoff_factor).min(self.max_backoff.as_secs_f64()),
        )
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

// ---------------------------------------------------------------------------
// Definition
// ---------------------------------------------------------------------------

/// Where control goes after a step succeeds.
pub enum Transition<S> {
    End,
    Goto(StepId),
    Route {
        targets: Vec<StepId>,
        router: Router<S>,
    },
}

impl<S> Transition<S> {
    pub(crate) fn targets(&self) -> Vec<StepId> {
        match self {
            Self::End => Vec::new(),
            Self::Goto(id) => vec![*id],
            Self::Route { targets, .. } => targets.clone(),
        }
    }
}

/// Declaration of one step: its I/O contract, retry policy and edges.
pub struct StepDefinition<S: WorkflowState> {
    pub(crate) id: StepId,
    pub(crate) step: Arc<dyn Step<S>>,
    pub(crate) requires: Vec<S::Field>,
    pub(crate) produces: Vec<S::Field>,
    pub(crate) retry: RetryPolicy,
    pub(crate) detached: bool,
    pub(crate) uninterruptible: bool,
    pub(crate) transition: Transition<S>,
    pub(crate) on_error: Option<StepId>,
    pub(crate) fallback: Option<StepId>,
}

impl<S: WorkflowState> StepDefinition<S> {
    /// A step with no declared fields that ends the run when it succeeds.
    pub fn new(id: StepId, step: impl Step<S> + 'static) -> Self {
        Self {
            id,
            step: Arc::new(step),
            requires: Vec::new(),
            produces: Vec::new(),
            retry: RetryPolicy::none(),
            detached: false,
            uninterruptible: false,
            transition: Transition::End,
            on_error: None,
            fallback: None,
        }
    }

    pub fn requires(mut self, fields: impl IntoIterator<Item = S::Field>) -> Self {
        self.requires = fields.into_iter().collect();
        self
    }

    pub fn produces(mut self, fields: impl IntoIterator<Item = S::Field>) -> Self {
        self.produces = fields.into_iter().collect();
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Run the step concurrently without gating the main path. Its outputs
    /// are never merged into the run's state; failures go to the graph's
    /// detached error sink.
    pub fn detached(mut self) -> Self {
        self.detached = true;
        self
    }

    /// Let the step finish even if the run is cancelled meanwhile.
    /// Cancellation takes effect right after it.
    pub fn uninterruptible(mut self) -> Self {
        self.uninterruptible = true;
        self
    }

    pub fn then(mut self, next: StepId) -> Self {
        self.transition = Transition::Goto(next);
        self
    }

    /// Route to one of `targets` chosen by `router`.
    pub fn route<F>(mut self, targets: impl IntoIterator<Item = StepId>, router: F) -> Self
    where
        F: Fn(&S) -> StepId + Send + Sync + 'static,
    {
        self.transition = Transition::Route {
            targets: targets.into_iter().collect(),
            router: Arc::new(router),
        };
        self
    }

    /// Step that receives control when this one fails unrecoverably.
    pub fn on_error(mut self, error_step: StepId) -> Self {
        self.on_error = Some(error_step);
        self
    }

    /// Best-effort path taken when retries on a transient error run out.
    pub fn fallback(mut self, next: StepId) -> Self {
        self.fallback = Some(next);
        self
    }

    pub fn id(&self) -> StepId {
        self.id
    }
}
