//! CLI argument definitions for bizplanner.
//!
//! All `clap` structures live here so that `main.rs` stays focused on
//! dispatching subcommands.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

/// bizplanner -- work items with history-based duration estimates.
#[derive(Parser)]
#[command(
    name = "bizplanner",
    version,
    about = "bizplanner -- work items with history-based duration estimates",
    long_about = "Turns short voice or text requests into work items and estimates their \
                  duration from completed work of the same business."
)]
pub struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, short, global = true, default_value = bizplanner_pipeline::DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create the data directory and database, and check the API key.
    Setup,

    /// Show configuration, database and item counts.
    Status,

    /// Create a work item from text or a voice message.
    Create {
        /// The request as free text.
        #[arg(conflicts_with = "audio", required_unless_present = "audio")]
        text: Option<String>,

        /// Path to a voice message (OGG/Opus).
        #[arg(long)]
        audio: Option<PathBuf>,

        /// Who asked for it.
        #[arg(long)]
        requester: Option<String>,

        /// Recent conversation passed to the parser.
        #[arg(long)]
        recent: Option<String>,
    },

    /// Mark an open item done with its actual duration.
    Complete {
        id: i64,
        /// Actual duration in minutes (1-480).
        minutes: u32,
    },

    /// Archive an open or done item.
    Archive { id: i64 },

    /// Show one item as JSON.
    Show { id: i64 },

    /// List items of one business.
    List {
        /// Context id.
        #[arg(long)]
        context: i64,

        #[arg(long, value_enum)]
        status: Option<StatusArg>,

        #[arg(long, default_value_t = 20)]
        limit: u32,
    },

    /// Print the aggregate report now.
    Report,

    /// Print the aggregate report on the configured cron schedule.
    Schedule {
        /// Override the cron expression from the config file.
        #[arg(long)]
        cron: Option<String>,
    },

    /// Write embeddings for items whose background embedding failed.
    Backfill {
        #[arg(long, default_value_t = 100)]
        limit: u32,
    },
}

#[derive(Clone, Copy, ValueEnum)]
pub enum StatusArg {
    Open,
    Done,
    Archived,
}
