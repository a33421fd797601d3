//! Run lifecycle events.

use crate::ids::{RunId, StageId, WorkerId};
use crate::pipeline::BarrierPolicy;
use crate::run::{FailureReason, StageState, Verdict};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// All events emitted while a run executes.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    RunStarted(RunStartedPayload),
    BatchStarted(BatchStartedPayload),
    StageAssigned(StageAssignedPayload),
    StageTransitioned(StageTransitionedPayload),
    BatchCompleted(BatchCompletedPayload),
    RunCompleted(RunCompletedPayload),
}

impl Event {
    /// Routing subject for this event.
    pub fn subject(&self) -> String {
        match self {
            Event::RunStarted(p) => format!("run.started.{}", p.run_id),
            Event::BatchStarted(p) => format!("run.{}.batch.{}.started", p.run_id, p.batch),
            Event::StageAssigned(p) => format!("run.{}.stage.{}.assigned", p.run_id, p.stage),
            Event::StageTransitioned(p) => format!("run.{}.stage.{}.{}", p.run_id, p.stage, p.to),
            Event::BatchCompleted(p) => format!("run.{}.batch.{}.completed", p.run_id, p.batch),
            Event::RunCompleted(p) => format!("run.completed.{}", p.run_id),
        }
    }

    pub fn run_id(&self) -> RunId {
        match self {
            Event::RunStarted(p) => p.run_id,
            Event::BatchStarted(p) => p.run_id,
            Event::StageAssigned(p) => p.run_id,
            Event::StageTransitioned(p) => p.run_id,
            Event::BatchCompleted(p) => p.run_id,
            Event::RunCompleted(p) => p.run_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RunStartedPayload {
    pub run_id: RunId,
    pub name: Option<String>,
    pub stage_count: usize,
    pub batch_count: usize,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct BatchStartedPayload {
    pub run_id: RunId,
    pub batch: usize,
    pub stages: Vec<StageId>,
    /// Policy of the barrier this batch waited on, if any.
    pub gate: Option<BarrierPolicy>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StageAssignedPayload {
    pub run_id: RunId,
    pub stage: StageId,
    pub worker: WorkerId,
    pub assigned_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StageTransitionedPayload {
    pub run_id: RunId,
    pub stage: StageId,
    pub from: StageState,
    pub to: StageState,
    pub failure: Option<FailureReason>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct BatchCompletedPayload {
    pub run_id: RunId,
    pub batch: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RunCompletedPayload {
    pub run_id: RunId,
    pub verdict: Verdict,
    pub duration_ms: u64,
    pub completed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subjects() {
        let run_id = RunId::new();
        let event = Event::StageTransitioned(StageTransitionedPayload {
            run_id,
            stage: StageId::new("Docs"),
            from: StageState::Running,
            to: StageState::Succeeded,
            failure: None,
            at: Utc::now(),
        });
        assert_eq!(event.subject(), format!("run.{run_id}.stage.Docs.succeeded"));
        assert_eq!(event.run_id(), run_id);

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "stage_transitioned");
    }
}
