//! CLI entry point for bizplanner.
//!
//! Loads `.env` and the TOML config, initialises logging, then dispatches
//! to one subcommand. Commands that do not call external services work
//! without an API key.

mod cli;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use bizplanner_adapters::OpenAiClient;
use bizplanner_pipeline::format::render_item_line;
use bizplanner_pipeline::{
    CreateRequest, DetachedFailure, FeedbackRecorder, LogFormat, PipelineError, Planner,
    PlannerConfig, ReportPipeline, ReportScheduler, Services,
};
use bizplanner_store::{ContextId, Database, WorkItemStatus, WorkItemStore};
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands, StatusArg};

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _ = dotenvy::dotenv();

    let config = PlannerConfig::load(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;

    let default_level = match cli.command {
        Commands::Status | Commands::Show { .. } | Commands::List { .. } => "warn",
        _ => "info",
    };
    init_tracing(default_level, config.log_format);

    match cli.command {
        Commands::Setup => cmd_setup(&config).await,
        Commands::Status => cmd_status(&cli.config, &config).await,
        Commands::Create {
            text,
            audio,
            requester,
            recent,
        } => cmd_create(config, text, audio, requester, recent).await,
        Commands::Complete { id, minutes } => cmd_complete(&config, id, minutes).await,
        Commands::Archive { id } => cmd_archive(&config, id).await,
        Commands::Show { id } => cmd_show(&config, id).await,
        Commands::List {
            context,
            status,
            limit,
        } => cmd_list(&config, context, status, limit).await,
        Commands::Report => cmd_report(config).await,
        Commands::Schedule { cron } => cmd_schedule(config, cron).await,
        Commands::Backfill { limit } => cmd_backfill(config, limit).await,
    }
}

// ---------------------------------------------------------------------------
// Subcommand: setup
// ---------------------------------------------------------------------------

async fn cmd_setup(config: &PlannerConfig) -> Result<()> {
    println!();
    println!("  bizplanner setup");
    println!("  ================");
    println!();

    let db_path = config.database.path.clone();
    if let Some(dir) = db_path.parent().filter(|d| !d.as_os_str().is_empty()) {
        if dir.exists() {
            println!("  [=] Data directory already exists");
        } else {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
            println!("  [+] Created data directory {}", dir.display());
        }
    }

    let display_path = db_path.display().to_string();
    Database::open_and_migrate(db_path)
        .await
        .context("failed to initialize database")?;
    println!("  [+] Database initialized at {display_path}");

    if config.openai.api_key.is_some() {
        println!("  [+] OPENAI_API_KEY is set");
    } else {
        println!("  [!] OPENAI_API_KEY is not set");
        println!("      Set it in your environment or .env to create items:");
        println!("      export OPENAI_API_KEY=sk-...");
    }

    println!();
    println!("  Contexts:");
    for ctx in &config.contexts {
        println!("    {:>3}  {}", ctx.id, ctx.name);
    }
    println!();
    println!("  Setup complete! Run `bizplanner create \"...\"` to add a work item.");
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommand: status
// ---------------------------------------------------------------------------

async fn cmd_status(config_path: &Path, config: &PlannerConfig) -> Result<()> {
    println!();
    println!("  bizplanner status");
    println!("  =================");
    println!();

    if config_path.exists() {
        println!("  Config:           OK ({})", config_path.display());
    } else {
        println!("  Config:           DEFAULTS ({} not found)", config_path.display());
    }
    match config.openai.api_key {
        Some(_) => println!("  OpenAI API:       CONFIGURED"),
        None => println!("  OpenAI API:       NOT SET"),
    }

    let db_path = &config.database.path;
    if !db_path.exists() {
        println!("  Database:         NOT INITIALIZED (run `bizplanner setup`)");
        println!();
        return Ok(());
    }
    println!("  Database:         OK ({})", db_path.display());

    let store = open_store(config).await?;
    let counts = store.count_by_status().await?;
    println!();
    println!("  {:<16} {:>6} {:>6} {:>9}", "Context", "open", "done", "archived");
    for ctx in &config.contexts {
        let count = |status: WorkItemStatus| {
            counts
                .iter()
                .find(|c| c.context_id == ContextId(ctx.id) && c.status == status)
                .map_or(0, |c| c.count)
        };
        println!(
            "  {:<16} {:>6} {:>6} {:>9}",
            ctx.name,
            count(WorkItemStatus::Open),
            count(WorkItemStatus::Done),
            count(WorkItemStatus::Archived)
        );
    }
    let missing = store.list_missing_embeddings(10_000).await?.len();
    if missing > 0 {
        println!();
        println!("  {missing} item(s) without embedding (run `bizplanner backfill`)");
    }
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommand: create
// ---------------------------------------------------------------------------

async fn cmd_create(
    config: PlannerConfig,
    text: Option<String>,
    audio: Option<PathBuf>,
    requester: Option<String>,
    recent: Option<String>,
) -> Result<()> {
    let mut request = match (text, audio) {
        (_, Some(path)) => {
            let bytes = tokio::fs::read(&path)
                .await
                .with_context(|| format!("failed to read {}", path.display()))?;
            CreateRequest::audio(bytes)
        }
        (Some(text), None) => CreateRequest::text(text),
        (None, None) => anyhow::bail!("either a text request or --audio is required"),
    };
    request.requester_id = requester;
    request.recent_context = recent;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let planner = build_planner(config, Some(tx)).await?;

    match planner.create.run(request).await {
        Ok(mut outcome) => {
            println!("{}", outcome.response);
            outcome.join_background().await;
            drop(planner);
            while let Some(failure) = rx.recv().await {
                warn!(step = failure.step, error = %failure.error, "background step failed");
            }
            Ok(())
        }
        Err(PipelineError::Rejected { message, error }) => {
            error!(kind = %error.kind, detail = %error.detail, "request rejected");
            anyhow::bail!("{message}")
        }
        Err(e) => Err(e.into()),
    }
}

// ---------------------------------------------------------------------------
// Subcommands: complete / archive / show / list
// ---------------------------------------------------------------------------

async fn cmd_complete(config: &PlannerConfig, id: i64, minutes: u32) -> Result<()> {
    let recorder = FeedbackRecorder::new(open_store(config).await?);
    let item = recorder.record_completion(id, minutes).await?;
    println!("{}", render_item_line(&item));
    if let Some(accuracy) = item.estimation_accuracy() {
        println!("Estimate accuracy: {:.0}%", accuracy * 100.0);
    }
    Ok(())
}

async fn cmd_archive(config: &PlannerConfig, id: i64) -> Result<()> {
    let recorder = FeedbackRecorder::new(open_store(config).await?);
    let item = recorder.archive(id).await?;
    println!("{}", render_item_line(&item));
    Ok(())
}

async fn cmd_show(config: &PlannerConfig, id: i64) -> Result<()> {
    let item = open_store(config).await?.get(id).await?;
    println!("{}", serde_json::to_string_pretty(&item)?);
    Ok(())
}

async fn cmd_list(
    config: &PlannerConfig,
    context: i64,
    status: Option<StatusArg>,
    limit: u32,
) -> Result<()> {
    let context_id = ContextId(context);
    if !config.context_ids().contains(&context_id) {
        anyhow::bail!("unknown context {context}");
    }
    let status = status.map(|s| match s {
        StatusArg::Open => WorkItemStatus::Open,
        StatusArg::Done => WorkItemStatus::Done,
        StatusArg::Archived => WorkItemStatus::Archived,
    });

    let items = open_store(config)
        .await?
        .list_by_context(context_id, status, limit)
        .await?;
    println!("{} ({} items)", config.context_name(context_id), items.len());
    for item in &items {
        println!("  {}", render_item_line(item));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommands: report / schedule / backfill
// ---------------------------------------------------------------------------

async fn cmd_report(config: PlannerConfig) -> Result<()> {
    let store = open_store(&config).await?;
    let pipeline = ReportPipeline::new(Arc::new(config), store)?;
    let report = pipeline.run(chrono::Utc::now()).await?;
    println!("{}", report.rendered);
    Ok(())
}

async fn cmd_schedule(config: PlannerConfig, cron: Option<String>) -> Result<()> {
    let expr = cron.unwrap_or_else(|| config.report.cron.clone());
    let store = open_store(&config).await?;
    let pipeline = Arc::new(ReportPipeline::new(Arc::new(config), store)?);

    let mut scheduler = ReportScheduler::new(&expr)?;
    if let Some(next) = scheduler.next_after(chrono::Utc::now()) {
        info!(cron = %expr, next = %next, "next report scheduled");
    }
    scheduler.start(pipeline, |report| println!("{}\n", report.rendered))?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutting down");
    scheduler.stop().await;
    Ok(())
}

async fn cmd_backfill(config: PlannerConfig, limit: u32) -> Result<()> {
    let planner = build_planner(config, None).await?;
    let report = planner.backfill.run_once(limit).await?;
    println!("Embedded {} item(s)", report.embedded.len());
    for (id, reason) in &report.failed {
        println!("  #{id} failed: {reason}");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn open_store(config: &PlannerConfig) -> Result<WorkItemStore> {
    let path = config.database.path.clone();
    let db = Database::open_and_migrate(path)
        .await
        .context("failed to open database (run `bizplanner setup` first)")?;
    Ok(WorkItemStore::new(db))
}

async fn build_planner(
    config: PlannerConfig,
    detached_errors: Option<mpsc::UnboundedSender<DetachedFailure>>,
) -> Result<Planner> {
    let client = Arc::new(OpenAiClient::new(config.openai_config()?)?);
    let services = Services {
        transcriber: client.clone(),
        parser: client.clone(),
        embedder: client,
    };
    let db = Database::open_and_migrate(config.database.path.clone())
        .await
        .context("failed to open database (run `bizplanner setup` first)")?;
    Ok(Planner::new(config, db, services, detached_errors)?)
}

/// Initialize the tracing subscriber with the given default log level.
fn init_tracing(default_level: &str, format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Compact => builder.compact().init(),
        LogFormat::Json => builder.json().init(),
    }
}
