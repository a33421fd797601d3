//! Command handlers.

use crate::commands::{PlanArgs, RunArgs, WorkerArgs};
use crate::config::CliConfig;
use crate::sinks::{ArtifactDirSink, ConsoleSink, JsonFileSink, LogEventBus};
use console::style;
use keel_core::pipeline::PipelineDefinition;
use keel_core::resolver::resolve;
use keel_core::Error;
use keel_core::worker::Worker;
use keel_runner::{ShellConfig, ShellDispatcher};
use keel_scheduler::{Orchestrator, Scheduler, SchedulerConfig, StageGraphBuilder, WorkerPool};
use std::num::NonZeroUsize;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

type HandlerResult = Result<ExitCode, Box<dyn std::error::Error>>;

/// Configuration problems, including starvation, exit with 2.
const EXIT_CONFIG: u8 = 2;
/// Cancelled runs exit like an interrupted process.
const EXIT_CANCELLED: u8 = 130;

fn load_definition(path: &str) -> Result<PipelineDefinition, Box<dyn std::error::Error>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read {}: {}", path, e))?;
    let definition = serde_yaml::from_str(&content)
        .map_err(|e| format!("Failed to parse {}: {}", path, e))?;
    Ok(definition)
}

fn workers(config: &CliConfig, args: &WorkerArgs) -> Result<Vec<Worker>, Error> {
    if !args.workers.is_empty() {
        return args.workers.iter().map(|w| Worker::parse(w)).collect();
    }
    if !config.workers.is_empty() {
        return Ok(config.workers.clone());
    }
    Ok(vec![Worker::new("local")])
}

fn default_timeout(config: &CliConfig) -> Result<Option<Duration>, Error> {
    config
        .default_timeout_minutes
        .map(|minutes| {
            minutes
                .get()
                .checked_mul(60)
                .map(Duration::from_secs)
                .ok_or_else(|| {
                    Error::Configuration(format!("default_timeout_minutes {minutes} is too large"))
                })
        })
        .transpose()
}

fn report_error(error: &Error) -> ExitCode {
    eprintln!("{} {}", style("✗").red(), error);
    if error.is_configuration() || matches!(error, Error::SchedulingStarvation { .. }) {
        ExitCode::from(EXIT_CONFIG)
    } else {
        ExitCode::FAILURE
    }
}

/// Run a pipeline on the local shell.
pub async fn run(config: &CliConfig, args: RunArgs) -> HandlerResult {
    let definition = load_definition(&args.path)?;
    let context = args.context.build()?;

    let pool = match workers(config, &args.workers).and_then(WorkerPool::new) {
        Ok(pool) => pool,
        Err(e) => return Ok(report_error(&e)),
    };

    let working_dir = match args.working_dir.or_else(|| config.working_dir.clone()) {
        Some(dir) => dir,
        None => std::env::current_dir()?,
    };
    let dispatcher = Arc::new(ShellDispatcher::new(ShellConfig {
        working_dir,
        ..ShellConfig::default()
    }));

    let scheduler_config = match default_timeout(config).and_then(|default_timeout| {
        let scheduler_config = SchedulerConfig {
            max_parallel: args.max_parallel.or(config.max_parallel).map(NonZeroUsize::get),
            default_barrier: args.barrier.or(config.barrier_policy).unwrap_or_default(),
            default_timeout,
        };
        scheduler_config.validate()?;
        Ok(scheduler_config)
    }) {
        Ok(scheduler_config) => scheduler_config,
        Err(e) => return Ok(report_error(&e)),
    };
    let scheduler = Scheduler::new(pool, dispatcher, Arc::new(LogEventBus), scheduler_config);

    let mut orchestrator = Orchestrator::new(scheduler).with_sink(Arc::new(ConsoleSink));
    if let Some(path) = args.report {
        orchestrator = orchestrator.with_sink(Arc::new(JsonFileSink::new(path)));
    }
    if let Some(dir) = args.artifacts_dir {
        orchestrator = orchestrator.with_sink(Arc::new(ArtifactDirSink::new(dir)));
    }

    let handle = match orchestrator.prepare(&definition, context) {
        Ok(handle) => handle,
        Err(e) => return Ok(report_error(&e)),
    };

    println!(
        "{} Running {} ({})",
        style("▶").cyan(),
        style(definition.name.as_deref().unwrap_or(&args.path)).bold(),
        handle.id()
    );

    let interrupt = {
        let handle = handle.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!(run_id = %handle.id(), "Interrupted, cancelling run");
                handle.cancel("interrupted");
            }
        })
    };
    let result = orchestrator.execute(&handle).await;
    interrupt.abort();

    match result {
        Ok(report) => Ok(match report.into_result() {
            Ok(_) => ExitCode::SUCCESS,
            Err(e @ Error::RunCancelled { .. }) => {
                warn!("{e}");
                ExitCode::from(EXIT_CANCELLED)
            }
            Err(e) => {
                warn!("{e}");
                ExitCode::FAILURE
            }
        }),
        Err(e) => Ok(report_error(&e)),
    }
}

/// Validate a pipeline file.
pub fn validate(config: &CliConfig, path: &str) -> HandlerResult {
    let definition = load_definition(path)?;

    let graph = match resolve(&definition).and_then(|resolved| {
        StageGraphBuilder::new(config.barrier_policy.unwrap_or_default())
            .build(resolved.stages, &resolved.barriers)
    }) {
        Ok(graph) => graph,
        Err(e) => return Ok(report_error(&e)),
    };

    println!("{} Pipeline is valid", style("✓").green());
    if let Some(name) = &definition.name {
        println!("  Name: {}", name);
    }
    println!(
        "  Stages: {} in {} batch(es)",
        graph.stages().len(),
        graph.batches().len()
    );
    Ok(ExitCode::SUCCESS)
}

/// Show batches, predicate decisions and candidate workers.
pub fn plan(config: &CliConfig, args: PlanArgs) -> HandlerResult {
    let definition = load_definition(&args.path)?;
    let context = args.context.build()?;

    let resolved = match resolve(&definition) {
        Ok(resolved) => resolved,
        Err(e) => return Ok(report_error(&e)),
    };
    let graph = match StageGraphBuilder::new(config.barrier_policy.unwrap_or_default())
        .build(resolved.stages, &resolved.barriers)
    {
        Ok(graph) => graph,
        Err(e) => return Ok(report_error(&e)),
    };
    let pool = match workers(config, &args.workers).and_then(WorkerPool::new) {
        Ok(pool) => pool,
        Err(e) => return Ok(report_error(&e)),
    };

    let mut starved = false;
    for batch in graph.batches() {
        let gate = batch
            .gate
            .map(|policy| format!(" (gated: {:?})", policy))
            .unwrap_or_default();
        println!("{} Batch {}{}", style("▶").cyan(), batch.index + 1, gate);

        for stage in batch.stages.iter().filter_map(|&p| graph.stage(p)) {
            if !stage.predicate.evaluate(&context) {
                println!(
                    "  {} {} skipped: {}",
                    style("-").dim(),
                    stage.id,
                    stage.predicate.source().unwrap_or("false")
                );
                continue;
            }
            let matching = pool.matching(&stage.selector);
            if matching.is_empty() {
                starved = true;
                println!(
                    "  {} {} has no worker matching {}",
                    style("✗").red(),
                    stage.id,
                    stage.selector
                );
            } else {
                let names: Vec<_> = matching.iter().map(|w| w.to_string()).collect();
                println!(
                    "  {} {} on [{}]",
                    style("✓").green(),
                    stage.id,
                    names.join(", ")
                );
            }
        }
    }

    Ok(if starved {
        ExitCode::from(EXIT_CONFIG)
    } else {
        ExitCode::SUCCESS
    })
}

/// Print the pipeline JSON Schema.
pub fn schema() -> HandlerResult {
    let schema = schemars::schema_for!(PipelineDefinition);
    println!("{}", serde_json::to_string_pretty(&schema)?);
    Ok(ExitCode::SUCCESS)
}

/// Show configuration.
pub fn show_config(config: &CliConfig) -> HandlerResult {
    println!("{}", style("Keel CLI Configuration").bold());
    println!();
    print!("{}", serde_yaml::to_string(config)?);
    println!();
    println!("Config file: {}", CliConfig::config_path()?.display());
    Ok(ExitCode::SUCCESS)
}

/// Set configuration value.
pub fn set_config(key: &str, value: &str) -> HandlerResult {
    let mut config = CliConfig::load()?;
    config.set(key, value)?;
    config.save()?;
    println!("{} Set {} = {}", style("✓").green(), key, value);
    Ok(ExitCode::SUCCESS)
}
