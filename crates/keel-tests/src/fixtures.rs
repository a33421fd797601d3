//! Test fixtures for pipelines, workers and run contexts.

use keel_core::pipeline::{PipelineDefinition, PipelineStep, SharedBlock, StageDefinition};
use keel_core::predicate::RunContext;
use keel_core::worker::Worker;

/// Predicate gating the main pipeline: builds from forks run nothing.
pub const NOT_A_FORK: &str = "build.pull_request.repository.fork != true";

pub const BUILD_CONTAINER: &str = "Build container";
pub const BUILD_TEST: &str = "Build + Test";
pub const FMT_CLIPPY: &str = "fmt + clippy";
pub const DENY: &str = "Deny";
pub const DOCS: &str = "Docs";

/// The four stages after the container build.
pub const CHECKS: [&str; 4] = [BUILD_TEST, FMT_CLIPPY, DENY, DOCS];

/// Pipeline fixtures.
pub struct PipelineFixture;

impl PipelineFixture {
    /// Container build, a `wait`, then four independent checks. Every stage
    /// needs a `production=true` worker and is skipped on fork builds.
    /// "Build + Test" declares `Cargo.lock` as an artifact.
    pub fn rust_ci() -> PipelineDefinition {
        let mut definition = PipelineDefinition {
            name: Some("rust-ci".to_string()),
            ..Default::default()
        };
        definition.env.insert("CARGO_TERM_COLOR".to_string(), "always".to_string());
        definition.shared.insert(
            "production".to_string(),
            SharedBlock {
                agents: [("production".to_string(), "true".to_string())].into(),
                ..Default::default()
            },
        );

        let stage = |label: &str, command: &str| {
            StageDefinition::new(label)
                .command(command)
                .condition(NOT_A_FORK)
                .uses("production")
        };

        definition.steps = vec![
            PipelineStep::stage(stage(BUILD_CONTAINER, ".buildkite/build-container")),
            PipelineStep::wait(),
            PipelineStep::stage(
                stage(BUILD_TEST, "cargo build --all-features")
                    .command("cargo test --all-features")
                    .artifact("Cargo.lock"),
            ),
            PipelineStep::stage(stage(FMT_CLIPPY, "cargo fmt --check").command("cargo clippy")),
            PipelineStep::stage(stage(DENY, "cargo deny check")),
            PipelineStep::stage(stage(DOCS, "cargo doc --no-deps").env("RUSTDOCFLAGS", "-Dwarnings")),
        ];
        definition
    }

    /// `labels` in one batch, no predicates or selectors.
    pub fn flat(labels: &[&str]) -> PipelineDefinition {
        PipelineDefinition {
            steps: labels
                .iter()
                .map(|label| PipelineStep::stage(StageDefinition::new(*label).command("true")))
                .collect(),
            ..Default::default()
        }
    }

    /// Batches of labels separated by the given `wait` steps.
    pub fn batched(batches: &[&[&str]], wait: PipelineStep) -> PipelineDefinition {
        let mut steps = Vec::new();
        for (i, batch) in batches.iter().enumerate() {
            if i > 0 {
                steps.push(wait.clone());
            }
            steps.extend(
                batch
                    .iter()
                    .map(|label| PipelineStep::stage(StageDefinition::new(*label).command("true"))),
            );
        }
        PipelineDefinition {
            steps,
            ..Default::default()
        }
    }
}

/// Worker fixtures.
pub struct WorkerFixture;

impl WorkerFixture {
    /// `count` workers tagged `production=true`.
    pub fn production(count: usize) -> Vec<Worker> {
        (1..=count)
            .map(|i| Worker::new(format!("prod-{i}")).tag("production", "true"))
            .collect()
    }

    /// `count` untagged workers.
    pub fn generic(count: usize) -> Vec<Worker> {
        (1..=count).map(|i| Worker::new(format!("worker-{i}"))).collect()
    }
}

/// Run context fixtures.
pub struct ContextFixture;

impl ContextFixture {
    /// A push to the default branch.
    pub fn upstream() -> RunContext {
        RunContext::new()
            .with("build.source", "webhook")
            .with("build.branch", "master")
            .with("pipeline.default_branch", "master")
    }

    /// A pull request from a fork.
    pub fn fork() -> RunContext {
        RunContext::pull_request(42, true)
    }
}
