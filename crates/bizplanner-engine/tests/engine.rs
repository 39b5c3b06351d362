//! Integration tests for graph compilation and execution.
//!
//! All graphs here run over `Calc`, a tiny state with four fields.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bizplanner_engine::{
    CancelToken, ErrorKind, GraphBuilder, RetryPolicy, RunStatus, SchemaError, Step,
    StepDefinition, StepError, StepId, StepOutput, WorkflowState, join_detached, step_fn,
};
use tokio::sync::mpsc;

// ═══════════════════════════════════════════════════════════════════════
//  Test state
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
enum Field {
    Seed,
    Doubled,
    Label,
    Audit,
}

#[derive(Debug, Clone)]
enum Value {
    Doubled(i64),
    Label(String),
    Audit(String),
}

#[derive(Debug, Clone, Default)]
struct Calc {
    seed: i64,
    doubled: Option<i64>,
    label: Option<String>,
    audit: Option<String>,
    error: Option<StepError>,
    degraded: Vec<StepId>,
}

impl WorkflowState for Calc {
    type Field = Field;
    type Value = Value;

    fn field_of(value: &Value) -> Field {
        match value {
            Value::Doubled(_) => Field::Doubled,
            Value::Label(_) => Field::Label,
            Value::Audit(_) => Field::Audit,
        }
    }

    fn apply(&mut self, value: Value) {
        match value {
            Value::Doubled(v) => self.doubled = Some(v),
            Value::Label(v) => self.label = Some(v),
            Value::Audit(v) => self.audit = Some(v),
        }
    }

    fn set_error(&mut self, error: StepError) {
        self.error = Some(error);
    }

    fn error(&self) -> Option<&StepError> {
        self.error.as_ref()
    }

    fn record_degradation(&mut self, step: StepId, _error: &StepError) {
        self.degraded.push(step);
    }
}

fn ok(values: Vec<Value>) -> Result<StepOutput<Calc>, StepError> {
    Ok(values)
}

fn fail(error: StepError) -> Result<StepOutput<Calc>, StepError> {
    Err(error)
}

struct Double;

#[async_trait]
impl Step<Calc> for Double {
    async fn run(&self, state: &Calc) -> Result<StepOutput<Calc>, StepError> {
        Ok(vec![Value::Doubled(state.seed * 2)])
    }
}

struct Label;

#[async_trait]
impl Step<Calc> for Label {
    async fn run(&self, state: &Calc) -> Result<StepOutput<Calc>, StepError> {
        let doubled = state
            .doubled
            .ok_or_else(|| StepError::internal("doubled missing"))?;
        Ok(vec![Value::Label(format!("value={doubled}"))])
    }
}

/// Fails with `error` for the first `failures` attempts, then succeeds.
struct Flaky {
    failures: u32,
    error: StepError,
    calls: Arc<AtomicU32>,
}

#[async_trait]
impl Step<Calc> for Flaky {
    async fn run(&self, _state: &Calc) -> Result<StepOutput<Calc>, StepError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            Err(self.error.clone())
        } else {
            Ok(vec![Value::Doubled(1)])
        }
    }
}

struct Sleep(Duration);

#[async_trait]
impl Step<Calc> for Sleep {
    async fn run(&self, _state: &Calc) -> Result<StepOutput<Calc>, StepError> {
        tokio::time::sleep(self.0).await;
        Ok(vec![Value::Doubled(0)])
    }
}

fn record_error() -> StepDefinition<Calc> {
    StepDefinition::new(
        "record_error",
        step_fn(|s: Calc| async move {
            let kind = s.error.map(|e| e.kind.as_str()).unwrap_or("none");
            ok(vec![Value::Audit(format!("error:{kind}"))])
        }),
    )
    .produces([Field::Audit])
}

fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::exponential(max_attempts, Duration::from_millis(1))
}

// ═══════════════════════════════════════════════════════════════════════
//  Compilation
// ═══════════════════════════════════════════════════════════════════════

#[test]
fn compile_requires_entry() {
    let err = GraphBuilder::<Calc>::new("g")
        .step(StepDefinition::new("double", Double))
        .compile()
        .err()
        .unwrap();
    assert_eq!(err, SchemaError::MissingEntry { graph: "g" });
}

#[test]
fn compile_rejects_unknown_successor() {
    let err = GraphBuilder::<Calc>::new("g")
        .entry("double")
        .step(StepDefinition::new("double", Double).then("nowhere"))
        .compile()
        .err()
        .unwrap();
    assert_eq!(
        err,
        SchemaError::UnknownStep {
            step: "double",
            target: "nowhere"
        }
    );
}

#[test]
fn compile_rejects_duplicate_and_unreachable() {
    let dup = GraphBuilder::<Calc>::new("g")
        .entry("double")
        .step(StepDefinition::new("double", Double))
        .step(StepDefinition::new("double", Double))
        .compile()
        .err()
        .unwrap();
    assert_eq!(dup, SchemaError::DuplicateStep { step: "double" });

    let orphan = GraphBuilder::<Calc>::new("g")
        .entry("double")
        .step(StepDefinition::new("double", Double))
        .step(StepDefinition::new("label", Label))
        .compile()
        .err()
        .unwrap();
    assert_eq!(orphan, SchemaError::Unreachable { step: "label" });
}

#[test]
fn compile_rejects_field_missing_on_one_branch() {
    // `label` needs Doubled, but the `skip` branch never produces it.
    let err = GraphBuilder::<Calc>::new("g")
        .inputs([Field::Seed])
        .entry("choose")
        .step(
            StepDefinition::new("choose", step_fn(|_: Calc| async { ok(vec![]) }))
                .requires([Field::Seed])
                .route(["double", "skip"], |s: &Calc| {
                    if s.seed > 0 { "double" } else { "skip" }
                }),
        )
        .step(
            StepDefinition::new("double", Double)
                .requires([Field::Seed])
                .produces([Field::Doubled])
                .then("label"),
        )
        .step(StepDefinition::new("skip", step_fn(|_: Calc| async { ok(vec![]) })).then("label"))
        .step(
            StepDefinition::new("label", Label)
                .requires([Field::Doubled])
                .produces([Field::Label]),
        )
        .compile()
        .err()
        .unwrap();
    assert_eq!(
        err,
        SchemaError::MissingInput {
            step: "label",
            field: "Doubled".into()
        }
    );
}

#[test]
fn detached_outputs_are_not_available_downstream() {
    let err = GraphBuilder::<Calc>::new("g")
        .inputs([Field::Seed])
        .entry("double")
        .step(
            StepDefinition::new("double", Double)
                .produces([Field::Doubled])
                .detached()
                .then("label"),
        )
        .step(
            StepDefinition::new("label", Label)
                .requires([Field::Doubled])
                .produces([Field::Label]),
        )
        .compile()
        .err()
        .unwrap();
    assert!(matches!(err, SchemaError::MissingInput { step: "label", .. }));
}

#[test]
fn error_step_only_sees_pre_failure_fields() {
    // The error step cannot rely on what the failing step would have produced.
    let err = GraphBuilder::<Calc>::new("g")
        .inputs([Field::Seed])
        .entry("double")
        .error_step("report")
        .step(StepDefinition::new("double", Double).produces([Field::Doubled]))
        .step(StepDefinition::new("report", Label).requires([Field::Doubled]))
        .compile()
        .err()
        .unwrap();
    assert!(matches!(err, SchemaError::MissingInput { step: "report", .. }));
}

#[test]
fn compile_rejects_zero_attempts() {
    let mut policy = RetryPolicy::none();
    policy.max_attempts = 0;
    let err = GraphBuilder::<Calc>::new("g")
        .entry("double")
        .step(StepDefinition::new("double", Double).retry(policy))
        .compile()
        .err()
        .unwrap();
    assert!(matches!(err, SchemaError::InvalidRetry { step: "double", .. }));
}

// ═══════════════════════════════════════════════════════════════════════
//  Execution
// ═══════════════════════════════════════════════════════════════════════

fn linear() -> bizplanner_engine::ExecutableGraph<Calc> {
    GraphBuilder::<Calc>::new("linear")
        .inputs([Field::Seed])
        .entry("double")
        .step(
            StepDefinition::new("double", Double)
                .requires([Field::Seed])
                .produces([Field::Doubled])
                .then("label"),
        )
        .step(
            StepDefinition::new("label", Label)
                .requires([Field::Doubled])
                .produces([Field::Label]),
        )
        .compile()
        .unwrap()
}

#[tokio::test]
async fn linear_run_merges_outputs() {
    let graph = linear();
    let report = graph
        .run(Calc {
            seed: 21,
            ..Default::default()
        })
        .await;

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.path, vec!["double", "label"]);
    assert_eq!(report.state.doubled, Some(42));
    assert_eq!(report.state.label.as_deref(), Some("value=42"));
    assert!(report.state.error.is_none());
}

#[tokio::test]
async fn same_outputs_take_same_path() {
    let graph = linear();
    let a = graph.run(Calc { seed: 3, ..Default::default() }).await;
    let b = graph.run(Calc { seed: 3, ..Default::default() }).await;
    assert_eq!(a.path, b.path);
    assert_eq!(a.state.label, b.state.label);
}

#[tokio::test]
async fn router_picks_declared_branch() {
    let graph = GraphBuilder::<Calc>::new("routed")
        .inputs([Field::Seed])
        .entry("choose")
        .step(
            StepDefinition::new("choose", step_fn(|_: Calc| async { ok(vec![]) })).route(
                ["big", "small"],
                |s: &Calc| if s.seed >= 10 { "big" } else { "small" },
            ),
        )
        .step(
            StepDefinition::new(
                "big",
                step_fn(|_: Calc| async { ok(vec![Value::Label("big".into())]) }),
            )
            .produces([Field::Label]),
        )
        .step(
            StepDefinition::new(
                "small",
                step_fn(|_: Calc| async { ok(vec![Value::Label("small".into())]) }),
            )
            .produces([Field::Label]),
        )
        .compile()
        .unwrap();

    let big = graph.run(Calc { seed: 50, ..Default::default() }).await;
    assert_eq!(big.path, vec!["choose", "big"]);
    let small = graph.run(Calc { seed: 1, ..Default::default() }).await;
    assert_eq!(small.path, vec!["choose", "small"]);
    assert_eq!(small.state.label.as_deref(), Some("small"));
}

#[tokio::test]
async fn router_outside_declared_set_fails_run() {
    let graph = GraphBuilder::<Calc>::new("bad_router")
        .entry("choose")
        .error_step("record_error")
        .step(
            StepDefinition::new("choose", step_fn(|_: Calc| async { ok(vec![]) }))
                .route(["a"], |_: &Calc| "b"),
        )
        .step(StepDefinition::new("a", step_fn(|_: Calc| async { ok(vec![]) })))
        .step(record_error())
        .compile()
        .unwrap();

    let report = graph.run(Calc::default()).await;
    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.path, vec!["choose", "record_error"]);
    assert_eq!(report.state.audit.as_deref(), Some("error:internal"));
}

#[tokio::test]
async fn transient_errors_are_retried_in_place() {
    let calls = Arc::new(AtomicU32::new(0));
    let graph = GraphBuilder::<Calc>::new("retry")
        .entry("flaky")
        .step(
            StepDefinition::new(
                "flaky",
                Flaky {
                    failures: 2,
                    error: StepError::transient("rate limited"),
                    calls: Arc::clone(&calls),
                },
            )
            .produces([Field::Doubled])
            .retry(fast_retry(3)),
        )
        .compile()
        .unwrap();

    let report = graph.run(Calc::default()).await;
    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(report.state.doubled, Some(1));
}

#[tokio::test]
async fn non_transient_errors_are_not_retried() {
    let calls = Arc::new(AtomicU32::new(0));
    let graph = GraphBuilder::<Calc>::new("no_retry")
        .entry("flaky")
        .error_step("record_error")
        .step(
            StepDefinition::new(
                "flaky",
                Flaky {
                    failures: 5,
                    error: StepError::validation("bad input"),
                    calls: Arc::clone(&calls),
                },
            )
            .produces([Field::Doubled])
            .retry(fast_retry(5)),
        )
        .step(record_error())
        .compile()
        .unwrap();

    let report = graph.run(Calc::default()).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(
        report.state.error.as_ref().map(|e| e.kind),
        Some(ErrorKind::Validation)
    );
    assert_eq!(report.state.audit.as_deref(), Some("error:validation"));
}

#[tokio::test]
async fn exhausted_transient_error_degrades_to_fallback() {
    let calls = Arc::new(AtomicU32::new(0));
    let graph = GraphBuilder::<Calc>::new("degrade")
        .entry("flaky")
        .error_step("record_error")
        .step(
            StepDefinition::new(
                "flaky",
                Flaky {
                    failures: 10,
                    error: StepError::transient("timeout"),
                    calls: Arc::clone(&calls),
                },
            )
            .produces([Field::Doubled])
            .retry(fast_retry(2))
            .fallback("default")
            .then("default"),
        )
        .step(StepDefinition::new(
            "default",
            step_fn(|_: Calc| async { ok(vec![Value::Label("default".into())]) }),
        )
        .produces([Field::Label]))
        .step(record_error())
        .compile()
        .unwrap();

    let report = graph.run(Calc::default()).await;
    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(report.path, vec!["flaky", "default"]);
    assert_eq!(report.state.degraded, vec!["flaky"]);
    assert!(report.state.error.is_none());
}

#[tokio::test]
async fn failure_without_error_step_terminates() {
    let graph = GraphBuilder::<Calc>::new("bare")
        .entry("fail")
        .step(
            StepDefinition::new(
                "fail",
                step_fn(|_: Calc| async { fail(StepError::not_found("item 9")) }),
            )
            .then("never"),
        )
        .step(StepDefinition::new("never", Double))
        .compile()
        .unwrap();

    let report = graph.run(Calc::default()).await;
    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.path, vec!["fail"]);
    assert_eq!(
        report.state.error.map(|e| e.kind),
        Some(ErrorKind::NotFound)
    );
}

#[tokio::test]
async fn undeclared_output_is_rejected() {
    let graph = GraphBuilder::<Calc>::new("sneaky")
        .entry("sneaky")
        .step(
            StepDefinition::new(
                "sneaky",
                step_fn(|_: Calc| async { ok(vec![Value::Audit("x".into())]) }),
            )
            .produces([Field::Label]),
        )
        .compile()
        .unwrap();

    let report = graph.run(Calc::default()).await;
    assert_eq!(report.status, RunStatus::Failed);
    assert!(report.state.audit.is_none());
}

#[tokio::test]
async fn detached_failure_goes_to_sink_not_caller() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let graph = GraphBuilder::<Calc>::new("detached")
        .inputs([Field::Seed])
        .entry("double")
        .detached_errors(tx)
        .step(
            StepDefinition::new("double", Double)
                .produces([Field::Doubled])
                .then("side"),
        )
        .step(
            StepDefinition::new(
                "side",
                step_fn(|_: Calc| async { fail(StepError::external("embedding service down")) }),
            )
            .detached()
            .then("label"),
        )
        .step(
            StepDefinition::new("label", Label)
                .requires([Field::Doubled])
                .produces([Field::Label]),
        )
        .compile()
        .unwrap();

    let mut report = graph.run(Calc { seed: 2, ..Default::default() }).await;
    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.path, vec!["double", "side", "label"]);
    assert!(report.state.error.is_none());

    let results = report.join_detached().await;
    assert_eq!(results.len(), 1);
    assert!(results[0].is_err());

    let failure = rx.recv().await.unwrap();
    assert_eq!(failure.step, "side");
    assert_eq!(failure.error.kind, ErrorKind::External);
}

#[tokio::test]
async fn detached_outputs_are_not_merged() {
    let graph = GraphBuilder::<Calc>::new("detached_merge")
        .entry("side")
        .step(
            StepDefinition::new(
                "side",
                step_fn(|_: Calc| async { ok(vec![Value::Audit("side".into())]) }),
            )
            .produces([Field::Audit])
            .detached(),
        )
        .compile()
        .unwrap();

    let mut report = graph.run(Calc::default()).await;
    assert!(report.join_detached().await[0].is_ok());
    assert!(report.state.audit.is_none());
}

#[tokio::test]
async fn cancellation_stops_scheduling() {
    let graph = GraphBuilder::<Calc>::new("cancel")
        .entry("slow")
        .step(
            StepDefinition::new("slow", Sleep(Duration::from_secs(5)))
                .produces([Field::Doubled])
                .then("label"),
        )
        .step(StepDefinition::new("label", Label).produces([Field::Label]))
        .compile()
        .unwrap();

    let cancel = CancelToken::new();
    let trigger = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        })
    };

    let report = graph.run_with_cancel(Calc::default(), &cancel).await;
    trigger.await.unwrap();
    assert_eq!(report.status, RunStatus::Cancelled);
    assert_eq!(report.path, vec!["slow"]);
    assert!(report.state.doubled.is_none());
    assert!(report.state.label.is_none());
}

#[tokio::test]
async fn deadline_cancels_run() {
    let graph = GraphBuilder::<Calc>::new("deadline")
        .entry("slow")
        .deadline(Duration::from_millis(20))
        .step(StepDefinition::new("slow", Sleep(Duration::from_secs(5))).produces([Field::Doubled]))
        .compile()
        .unwrap();

    let report = graph.run(Calc::default()).await;
    assert_eq!(report.status, RunStatus::Cancelled);
}

#[tokio::test]
async fn unrepresentable_deadline_means_no_deadline() {
    let graph = GraphBuilder::<Calc>::new("far_deadline")
        .entry("slow")
        .deadline(Duration::from_secs(u64::MAX))
        .step(StepDefinition::new("slow", Sleep(Duration::from_millis(1))).produces([Field::Doubled]))
        .compile()
        .unwrap();

    let report = graph.run(Calc::default()).await;
    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.state.doubled, Some(0));
}

#[tokio::test]
async fn uninterruptible_step_finishes_before_cancel_applies() {
    let graph = GraphBuilder::<Calc>::new("commit")
        .entry("commit")
        .step(
            StepDefinition::new("commit", Sleep(Duration::from_millis(50)))
                .produces([Field::Doubled])
                .uninterruptible()
                .then("label"),
        )
        .step(StepDefinition::new("label", Label).produces([Field::Label]))
        .compile()
        .unwrap();

    let cancel = CancelToken::new();
    let trigger = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            cancel.cancel();
        })
    };

    let report = graph.run_with_cancel(Calc::default(), &cancel).await;
    trigger.await.unwrap();
    assert_eq!(report.status, RunStatus::Cancelled);
    assert_eq!(report.path, vec!["commit"]);
    assert_eq!(report.state.doubled, Some(0));
    assert!(report.state.label.is_none());
}

#[tokio::test]
async fn join_detached_keeps_order_and_reports_panics() {
    let handles = vec![
        tokio::spawn(async { Ok(()) }),
        tokio::spawn(async { panic!("boom") }),
        tokio::spawn(async { Err(StepError::transient("busy")) }),
    ];

    let results = join_detached(handles).await;
    assert!(results[0].is_ok());
    assert_eq!(results[1].as_ref().unwrap_err().kind, ErrorKind::Internal);
    assert_eq!(results[2].as_ref().unwrap_err().kind, ErrorKind::TransientExternal);
}
