//! Resolved stages: the fully merged, validated form the scheduler consumes.

use crate::ids::StageId;
use crate::pipeline::BarrierPolicy;
use crate::predicate::Predicate;
use crate::worker::WorkerSelector;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Stage {
    pub id: StageId,
    /// Index in declaration order, counting stages only.
    pub position: usize,
    pub commands: Vec<String>,
    pub predicate: Predicate,
    pub selector: WorkerSelector,
    pub env: BTreeMap<String, String>,
    pub artifact_paths: Vec<String>,
    pub timeout_minutes: Option<u32>,
    pub priority: i32,
    pub concurrency: Option<ConcurrencyLimit>,
}

impl Stage {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_minutes
            .map(|m| Duration::from_secs(u64::from(m) * 60))
    }
}

/// At most `limit` stages sharing `group` may run at once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConcurrencyLimit {
    pub group: String,
    pub limit: u32,
}

/// A `wait` step, placed after the first `after` stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Barrier {
    pub after: usize,
    /// Explicit policy, or `None` to use the run-wide default.
    pub policy: Option<BarrierPolicy>,
}

/// Output of configuration resolution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedPipeline {
    pub name: Option<String>,
    pub stages: Vec<Stage>,
    pub barriers: Vec<Barrier>,
}

impl ResolvedPipeline {
    pub fn stage(&self, id: &StageId) -> Option<&Stage> {
        self.stages.iter().find(|s| &s.id == id)
    }
}
