//! Config resolution: merges shared blocks into each stage and validates the result.
//!
//! Precedence, lowest first: pipeline `env`, shared blocks in `uses` order,
//! stage-local values. Blocks are merged by value so no two stages share
//! mutable configuration.

use crate::ids::StageId;
use crate::pipeline::{PipelineDefinition, PipelineStep, SharedBlock, StageDefinition};
use crate::predicate::Predicate;
use crate::stage::{Barrier, ConcurrencyLimit, ResolvedPipeline, Stage};
use crate::worker::WorkerSelector;
use crate::{Error, Result};
use globset::Glob;
use std::collections::{BTreeMap, HashSet};
use tracing::debug;

const WAIT_KEYWORD: &str = "wait";

/// Resolve a raw definition into the ordered stage list plus barrier positions.
pub fn resolve(definition: &PipelineDefinition) -> Result<ResolvedPipeline> {
    let mut stages = Vec::new();
    let mut barriers = Vec::new();
    let mut labels = HashSet::new();

    for step in &definition.steps {
        match step {
            PipelineStep::Stage(raw) => {
                let stage = resolve_stage(raw, stages.len(), definition)?;
                if !labels.insert(stage.id.clone()) {
                    return Err(Error::config(format!("duplicate stage label `{}`", stage.id)));
                }
                stages.push(stage);
            }
            PipelineStep::Wait(wait) => barriers.push(Barrier {
                after: stages.len(),
                policy: wait.wait,
            }),
            PipelineStep::Keyword(keyword) if keyword.trim() == WAIT_KEYWORD => {
                barriers.push(Barrier {
                    after: stages.len(),
                    policy: None,
                })
            }
            PipelineStep::Keyword(keyword) => {
                return Err(Error::config(format!("unknown step keyword `{keyword}`")));
            }
        }
    }

    debug!(
        stages = stages.len(),
        barriers = barriers.len(),
        "Resolved pipeline configuration"
    );

    Ok(ResolvedPipeline {
        name: definition.name.clone(),
        stages,
        barriers,
    })
}

fn resolve_stage(
    raw: &StageDefinition,
    position: usize,
    definition: &PipelineDefinition,
) -> Result<Stage> {
    let label = raw.label.trim();
    if label.is_empty() {
        return Err(Error::config(format!("stage #{} has an empty label", position + 1)));
    }

    if raw.commands.is_empty() {
        return Err(Error::config(format!("stage `{label}` declares no commands")));
    }
    if raw.commands.iter().any(|c| c.trim().is_empty()) {
        return Err(Error::config(format!("stage `{label}` has a blank command")));
    }

    let blocks = raw
        .uses
        .iter()
        .map(|alias| {
            definition.shared.get(alias).ok_or_else(|| {
                Error::config(format!("stage `{label}` uses undefined alias `{alias}`"))
            })
        })
        .collect::<Result<Vec<&SharedBlock>>>()?;

    let mut env = definition.env.clone();
    let mut agents = BTreeMap::new();
    let mut timeout_minutes = None;
    for block in &blocks {
        env.extend(block.env.clone());
        agents.extend(block.agents.clone());
        timeout_minutes = block.timeout_minutes.or(timeout_minutes);
    }
    env.extend(raw.env.clone());
    agents.extend(raw.agents.clone());
    timeout_minutes = raw.timeout_minutes.or(timeout_minutes);

    if let Some((key, _)) = agents.iter().find(|(k, v)| k.trim().is_empty() || v.trim().is_empty()) {
        return Err(Error::config(format!(
            "stage `{label}` has an empty agent selector entry `{key}`"
        )));
    }
    if timeout_minutes == Some(0) {
        return Err(Error::config(format!("stage `{label}` has a zero timeout")));
    }

    for pattern in &raw.artifact_paths {
        if pattern.trim().is_empty() {
            return Err(Error::config(format!("stage `{label}` has a blank artifact path")));
        }
        Glob::new(pattern).map_err(|e| {
            Error::config(format!("stage `{label}` artifact path `{pattern}`: {e}"))
        })?;
    }

    let predicate = Predicate::parse_optional(raw.condition.as_deref())?;

    let concurrency = match (&raw.concurrency_group, raw.concurrency) {
        (None, None) => None,
        (Some(group), Some(limit)) if limit > 0 && !group.trim().is_empty() => {
            Some(ConcurrencyLimit {
                group: group.trim().to_string(),
                limit,
            })
        }
        _ => {
            return Err(Error::config(format!(
                "stage `{label}` must set both concurrency_group and a positive concurrency"
            )));
        }
    };

    Ok(Stage {
        id: StageId::new(label),
        position,
        commands: raw.commands.clone(),
        predicate,
        selector: WorkerSelector::from_map(agents),
        env,
        artifact_paths: raw.artifact_paths.clone(),
        timeout_minutes,
        priority: raw.priority,
        concurrency,
    })
}
