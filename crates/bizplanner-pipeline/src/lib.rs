//! # bizplanner-pipeline
//!
//! The workflows built on the engine: creating a work item from a voice or
//! text request, recording completions and archives, re-embedding items,
//! and the periodic report. [`Planner`] wires them together from a
//! [`PlannerConfig`].

pub mod backfill;
pub mod config;
pub mod create;
pub mod error;
pub mod feedback;
pub mod format;
pub mod report;
pub mod scheduler;
pub mod state;

use std::sync::Arc;

use bizplanner_estimator::{DurationEstimator, IsolatedRetriever};
use bizplanner_store::{Database, SqliteVectorIndex, WorkItemStore};
use tokio::sync::mpsc;

pub use backfill::{BackfillReport, BackfillService};
pub use bizplanner_engine::DetachedFailure;
pub use config::{DEFAULT_CONFIG_PATH, LogFormat, PlannerConfig};
pub use create::{CreateOutcome, CreateRequest, CreateWorkItem, Services};
pub use error::{PipelineError, Result};
pub use feedback::FeedbackRecorder;
pub use report::{ContextItems, ContextSummary, Report, ReportPipeline};
pub use scheduler::ReportScheduler;
pub use state::{RawInput, RequestState};

/// Every workflow of the planner over one database.
pub struct Planner {
    pub config: Arc<PlannerConfig>,
    pub store: WorkItemStore,
    pub create: CreateWorkItem,
    pub feedback: FeedbackRecorder,
    pub backfill: BackfillService,
    pub report: Arc<ReportPipeline>,
}

impl Planner {
    /// Build all workflows. Detached step failures are sent to
    /// `detached_errors` when given; they are always logged.
    pub fn new(
        config: PlannerConfig,
        db: Database,
        services: Services,
        detached_errors: Option<mpsc::UnboundedSender<DetachedFailure>>,
    ) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let store = WorkItemStore::new(db.clone());
        let index = Arc::new(SqliteVectorIndex::new(db));
        let retriever = IsolatedRetriever::new(index, config.context_ids());
        let estimator = DurationEstimator::new(retriever, config.estimator_config());

        let backfill = BackfillService::new(
            store.clone(),
            Arc::clone(&services.embedder),
            config.retrieval.embedding_dimension,
        );
        let create = CreateWorkItem::new(
            Arc::clone(&config),
            services,
            store.clone(),
            estimator,
            detached_errors,
        )?;
        let report = Arc::new(ReportPipeline::new(Arc::clone(&config), store.clone())?);

        Ok(Self {
            feedback: FeedbackRecorder::new(store.clone()),
            config,
            store,
            create,
            backfill,
            report,
        })
    }
}
