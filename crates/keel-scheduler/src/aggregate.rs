//! Run aggregation: verdict plus merged artifacts.

use crate::run::Run;
use chrono::Utc;
use keel_core::artifact::ArtifactCollection;
use keel_core::run::{FailureReason, RunReport, StageState, Verdict};
use keel_core::{Error, Result};

/// Verdict over the final stage states.
///
/// Any stage failing for its own reasons fails the run. Otherwise a run with
/// cancelled stages is `Cancelled`. Skipped stages count as success.
pub fn verdict(run: &Run) -> Verdict {
    if run.outcomes.iter().any(|o| o.failed_on_its_own()) {
        Verdict::Failed
    } else if run.outcomes.iter().any(|o| {
        o.state == StageState::Cancelled || o.failure == Some(FailureReason::Cancelled)
    }) {
        Verdict::Cancelled
    } else {
        Verdict::Succeeded
    }
}

/// Build the final report. Every stage must be terminal.
///
/// Artifacts are keyed by stage label + path; two stages landing on the same
/// key is an [`Error::ArtifactCollision`]. Stage outcomes are left untouched
/// either way.
pub fn aggregate(run: &Run) -> Result<RunReport> {
    if let Some(open) = run.outcomes.iter().find(|o| !o.state.is_terminal()) {
        return Err(Error::Internal(format!(
            "cannot aggregate run {}: stage `{}` is still {}",
            run.id, open.stage, open.state
        )));
    }

    let mut artifacts = ArtifactCollection::new();
    for outcome in &run.outcomes {
        for artifact in &outcome.artifacts {
            artifacts.insert(artifact.clone())?;
        }
    }

    let completed_at = run.completed_at.unwrap_or_else(Utc::now);
    let duration_ms = (completed_at - run.started_at).num_milliseconds().max(0) as u64;

    let mut stages = run.outcomes.clone();
    stages.sort_by_key(|o| o.position);

    Ok(RunReport {
        run_id: run.id,
        name: run.name.clone(),
        verdict: verdict(run),
        stages,
        artifacts,
        cancel_reason: run.cancel_reason.clone(),
        started_at: run.started_at,
        completed_at,
        duration_ms,
    })
}
