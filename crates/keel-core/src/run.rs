//! Stage execution states, outcomes and the final run report.

use crate::artifact::{Artifact, ArtifactCollection};
use crate::ids::{RunId, StageId, WorkerId};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    Pending,
    Assigned,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
}

impl StageState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StageState::Succeeded | StageState::Failed | StageState::Skipped | StageState::Cancelled
        )
    }

    /// Whether a barrier treats this state as a success.
    pub fn counts_as_success(&self) -> bool {
        matches!(self, StageState::Succeeded | StageState::Skipped)
    }

    pub fn can_transition_to(&self, next: StageState) -> bool {
        use StageState::*;
        matches!(
            (self, next),
            (Pending, Skipped)
                | (Pending, Assigned)
                | (Pending, Cancelled)
                | (Assigned, Running)
                | (Assigned, Cancelled)
                | (Running, Succeeded)
                | (Running, Failed)
        )
    }
}

impl fmt::Display for StageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StageState::Pending => "pending",
            StageState::Assigned => "assigned",
            StageState::Running => "running",
            StageState::Succeeded => "succeeded",
            StageState::Failed => "failed",
            StageState::Skipped => "skipped",
            StageState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Why a stage ended `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum FailureReason {
    CommandFailed { index: usize, exit_code: i32 },
    TimedOut { after_secs: u64 },
    MissingArtifact { pattern: String },
    Cancelled,
    Dispatch { message: String },
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::CommandFailed { index, exit_code } => {
                write!(f, "command #{} exited with {exit_code}", index + 1)
            }
            FailureReason::TimedOut { after_secs } => write!(f, "timed out after {after_secs}s"),
            FailureReason::MissingArtifact { pattern } => {
                write!(f, "declared artifact `{pattern}` not found")
            }
            FailureReason::Cancelled => f.write_str("cancelled while running"),
            FailureReason::Dispatch { message } => write!(f, "dispatch error: {message}"),
        }
    }
}

/// Final record of one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageOutcome {
    pub stage: StageId,
    pub position: usize,
    pub state: StageState,
    pub worker: Option<WorkerId>,
    pub failure: Option<FailureReason>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    #[serde(skip)]
    pub artifacts: Vec<Artifact>,
}

impl StageOutcome {
    pub fn pending(stage: StageId, position: usize) -> Self {
        Self {
            stage,
            position,
            state: StageState::Pending,
            worker: None,
            failure: None,
            started_at: None,
            completed_at: None,
            duration_ms: None,
            artifacts: Vec::new(),
        }
    }

    /// Failed for a reason other than run cancellation.
    pub fn failed_on_its_own(&self) -> bool {
        self.state == StageState::Failed && self.failure != Some(FailureReason::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Succeeded,
    Failed,
    Cancelled,
}

impl Verdict {
    pub fn is_success(&self) -> bool {
        matches!(self, Verdict::Succeeded)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Succeeded => f.write_str("succeeded"),
            Verdict::Failed => f.write_str("failed"),
            Verdict::Cancelled => f.write_str("cancelled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub name: Option<String>,
    pub verdict: Verdict,
    /// Per-stage outcomes in declared order.
    pub stages: Vec<StageOutcome>,
    pub artifacts: ArtifactCollection,
    pub cancel_reason: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl RunReport {
    pub fn outcome(&self, stage: &str) -> Option<&StageOutcome> {
        self.stages.iter().find(|o| o.stage.as_str() == stage)
    }

    pub fn count(&self, state: StageState) -> usize {
        self.stages.iter().filter(|o| o.state == state).count()
    }

    /// Turn a non-successful verdict into an error naming the first failed
    /// stage, or the cancellation reason.
    pub fn into_result(self) -> Result<Self> {
        match self.verdict {
            Verdict::Succeeded => Ok(self),
            Verdict::Cancelled => Err(Error::RunCancelled {
                reason: self.cancel_reason.unwrap_or_else(|| "cancelled".to_string()),
            }),
            Verdict::Failed => {
                let failed = self
                    .stages
                    .iter()
                    .find(|o| o.failed_on_its_own())
                    .or_else(|| self.stages.iter().find(|o| o.state == StageState::Failed));
                match failed {
                    Some(outcome) => Err(Error::StageFailure {
                        stage: outcome.stage.to_string(),
                        reason: outcome
                            .failure
                            .as_ref()
                            .map_or_else(|| "failed".to_string(), ToString::to_string),
                    }),
                    None => Err(Error::Internal("failed run without a failed stage".to_string())),
                }
            }
        }
    }
}
