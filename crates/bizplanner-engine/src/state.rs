//! The typed state schema a workflow runs over.
//!
//! Every field a step may read or write is a variant of the state's
//! `Field` enum, so a misspelt or renamed field is a compile error rather
//! than silently missing data. Steps return partial updates as `Value`s,
//! each tagged with exactly one field; the runner merges them in order
//! (last write wins).

use std::fmt::Debug;
use std::hash::Hash;

use crate::error::StepError;
use crate::step::StepId;

/// A schema-declared bag of fields owned by one workflow run.
pub trait WorkflowState: Clone + Send + Sync + 'static {
    /// Field names of the schema.
    type Field: Copy + Eq + Ord + Hash + Debug + Send + Sync + 'static;

    /// A single-field partial update.
    type Value: Debug + Send + 'static;

    /// The field a value writes to.
    fn field_of(value: &Self::Value) -> Self::Field;

    /// Merge one value into the state.
    fn apply(&mut self, value: Self::Value);

    /// Fill the terminal error slot.
    fn set_error(&mut self, error: StepError);

    fn error(&self) -> Option<&StepError>;

    /// Called when a step exhausted its retries on a transient error and
    /// the run continued on the step's declared fallback path.
    fn record_degradation(&mut self, _step: StepId, _error: &StepError) {}
}
