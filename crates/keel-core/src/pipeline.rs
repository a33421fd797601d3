//! Pipeline definition types.
//!
//! These types are the already-structured stage list handed over by the
//! configuration parser: an ordered list of stages and `wait` barriers plus
//! named shared blocks that stages pull in through `uses`.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct PipelineDefinition {
    #[serde(default)]
    pub name: Option<String>,
    /// Pipeline-wide environment, lowest precedence.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Named configuration blocks referenced by stages through `uses`.
    #[serde(default)]
    pub shared: BTreeMap<String, SharedBlock>,
    pub steps: Vec<PipelineStep>,
}

/// One entry of the ordered step list.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum PipelineStep {
    Stage(StageDefinition),
    Wait(WaitStep),
    /// Bare keyword form, e.g. `- wait`.
    Keyword(String),
}

impl PipelineStep {
    pub fn stage(definition: StageDefinition) -> Self {
        PipelineStep::Stage(definition)
    }

    pub fn wait() -> Self {
        PipelineStep::Wait(WaitStep { wait: None })
    }

    pub fn wait_with(policy: BarrierPolicy) -> Self {
        PipelineStep::Wait(WaitStep { wait: Some(policy) })
    }
}

/// `{ wait: ~ }` or `{ wait: require_success }`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct WaitStep {
    pub wait: Option<BarrierPolicy>,
}

/// What a barrier demands of the stages before it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum BarrierPolicy {
    /// Every earlier stage reached a terminal state, whatever the outcome.
    #[default]
    AwaitCompletion,
    /// As above, and no earlier stage failed; otherwise later stages are cancelled.
    RequireSuccess,
}

impl BarrierPolicy {
    /// The stricter of two policies.
    pub fn strictest(self, other: BarrierPolicy) -> BarrierPolicy {
        if self == BarrierPolicy::RequireSuccess || other == BarrierPolicy::RequireSuccess {
            BarrierPolicy::RequireSuccess
        } else {
            BarrierPolicy::AwaitCompletion
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct StageDefinition {
    pub label: String,
    #[serde(default)]
    pub commands: Vec<String>,
    /// Gating predicate, e.g. `build.pull_request.repository.fork != true`.
    #[serde(default, rename = "if")]
    pub condition: Option<String>,
    /// Shared blocks merged into this stage, in order.
    #[serde(default)]
    pub uses: Vec<String>,
    /// Worker selector as tag key/value pairs.
    #[serde(default)]
    pub agents: BTreeMap<String, String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub artifact_paths: Vec<String>,
    #[serde(default)]
    pub timeout_minutes: Option<u32>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub concurrency_group: Option<String>,
    #[serde(default)]
    pub concurrency: Option<u32>,
}

impl StageDefinition {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ..Default::default()
        }
    }

    pub fn command(mut self, command: impl Into<String>) -> Self {
        self.commands.push(command.into());
        self
    }

    pub fn condition(mut self, expression: impl Into<String>) -> Self {
        self.condition = Some(expression.into());
        self
    }

    pub fn uses(mut self, alias: impl Into<String>) -> Self {
        self.uses.push(alias.into());
        self
    }

    pub fn agent(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.agents.insert(key.into(), value.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn artifact(mut self, pattern: impl Into<String>) -> Self {
        self.artifact_paths.push(pattern.into());
        self
    }

    pub fn timeout_minutes(mut self, minutes: u32) -> Self {
        self.timeout_minutes = Some(minutes);
        self
    }
}

/// A named bundle of selector and environment values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SharedBlock {
    #[serde(default)]
    pub agents: BTreeMap<String, String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub timeout_minutes: Option<u32>,
}
