//! CLI command definitions.

use crate::context::ContextArgs;
use clap::{Args, Subcommand};
use keel_core::pipeline::BarrierPolicy;
use std::num::NonZeroUsize;
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum Commands {
    /// Run a pipeline on local workers
    Run(RunArgs),

    /// Validate pipeline configuration
    Validate {
        /// Path to pipeline file
        #[arg(default_value = "keel.yaml")]
        path: String,
    },

    /// Show batches, predicate decisions and matching workers without running
    Plan(PlanArgs),

    /// Print the JSON Schema of the pipeline format
    Schema,

    /// Manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Args)]
pub struct RunArgs {
    /// Path to pipeline file
    #[arg(default_value = "keel.yaml")]
    pub path: String,

    #[command(flatten)]
    pub context: ContextArgs,

    #[command(flatten)]
    pub workers: WorkerArgs,

    /// Maximum number of stages running at once
    #[arg(long)]
    pub max_parallel: Option<NonZeroUsize>,

    /// Policy for `wait` steps that do not name one
    #[arg(long, value_parser = crate::config::parse_barrier)]
    pub barrier: Option<BarrierPolicy>,

    /// Directory commands run in
    #[arg(long)]
    pub working_dir: Option<PathBuf>,

    /// Write the run report as JSON
    #[arg(long)]
    pub report: Option<PathBuf>,

    /// Copy collected artifacts into this directory
    #[arg(long)]
    pub artifacts_dir: Option<PathBuf>,
}

#[derive(Args)]
pub struct PlanArgs {
    /// Path to pipeline file
    #[arg(default_value = "keel.yaml")]
    pub path: String,

    #[command(flatten)]
    pub context: ContextArgs,

    #[command(flatten)]
    pub workers: WorkerArgs,
}

#[derive(Args)]
pub struct WorkerArgs {
    /// Worker as `id:key=value,flag` (repeatable); overrides configured workers
    #[arg(short, long = "worker", value_name = "WORKER")]
    pub workers: Vec<String>,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,

    /// Set configuration value
    Set {
        /// Key
        key: String,

        /// Value
        value: String,
    },
}
