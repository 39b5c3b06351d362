//! # bizplanner-engine
//!
//! A small typed workflow engine: declare steps with their required and
//! produced fields, wire them with plain or routed edges, compile, run.
//!
//! - Compilation ([`GraphBuilder::compile`]) rejects graphs whose steps
//!   reference unknown steps, are unreachable, or need a field that is
//!   not produced on every path into them.
//! - Steps retry transient errors in place with exponential backoff; any
//!   other error routes to the step's error step or fails the run.
//! - Detached steps run concurrently on their own state copy; failures go
//!   to a dedicated channel and never fail the main run.
//! - Runs honour a [`CancelToken`] and an overall deadline.

pub mod cancel;
pub mod error;
pub mod graph;
pub mod runner;
pub mod state;
pub mod step;

pub use cancel::CancelToken;
pub use error::{ErrorKind, Result, SchemaError, StepError};
pub use graph::GraphBuilder;
pub use runner::{DetachedFailure, ExecutableGraph, RunReport, RunStatus, join_detached};
pub use state::WorkflowState;
pub use step::{FnStep, RetryPolicy, Router, Step, StepDefinition, StepId, StepOutput, step_fn};
