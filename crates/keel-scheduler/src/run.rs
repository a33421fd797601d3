//! Live run state shared between the scheduler and observers.

use crate::graph::StageGraph;
use chrono::{DateTime, Utc};
use keel_core::events::{Event, StageTransitionedPayload};
use keel_core::predicate::RunContext;
use keel_core::run::{FailureReason, StageOutcome, StageState};
use keel_core::{Error, Result, RunId, StageId, WorkerId};
use keel_runner::{CancellationToken, StageExecution};
use parking_lot::RwLock;
use std::sync::Arc;

/// One pipeline invocation: graph, triggering context and outcome map.
#[derive(Debug)]
pub struct Run {
    pub id: RunId,
    pub name: Option<String>,
    pub graph: Arc<StageGraph>,
    pub context: RunContext,
    /// Indexed by stage position.
    pub outcomes: Vec<StageOutcome>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancel_reason: Option<String>,
}

impl Run {
    pub fn new(name: Option<String>, graph: StageGraph, context: RunContext) -> Self {
        let outcomes = graph
            .stages()
            .iter()
            .map(|s| StageOutcome::pending(s.id.clone(), s.position))
            .collect();
        Self {
            id: RunId::new(),
            name,
            graph: Arc::new(graph),
            context,
            outcomes,
            started_at: Utc::now(),
            completed_at: None,
            cancel_reason: None,
        }
    }

    pub fn state(&self, position: usize) -> Option<StageState> {
        self.outcomes.get(position).map(|o| o.state)
    }

    pub fn any_failed(&self) -> bool {
        self.outcomes.iter().any(|o| o.state == StageState::Failed)
    }
}

/// Cloneable handle to a run in progress.
#[derive(Clone)]
pub struct RunHandle {
    run: Arc<RwLock<Run>>,
    graph: Arc<StageGraph>,
    cancel: CancellationToken,
    id: RunId,
}

impl RunHandle {
    pub fn new(run: Run) -> Self {
        Self {
            id: run.id,
            graph: Arc::clone(&run.graph),
            run: Arc::new(RwLock::new(run)),
            cancel: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> RunId {
        self.id
    }

    pub fn graph(&self) -> &Arc<StageGraph> {
        &self.graph
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Request cancellation of the whole run.
    pub fn cancel(&self, reason: impl Into<String>) {
        let reason = reason.into();
        if self.cancel.cancel(reason.clone()) {
            self.run.write().cancel_reason = Some(reason);
        }
    }

    pub fn context(&self) -> RunContext {
        self.run.read().context.clone()
    }

    pub fn state(&self, position: usize) -> Option<StageState> {
        self.run.read().state(position)
    }

    /// Current state of every stage, in declared order.
    pub fn snapshot(&self) -> Vec<(StageId, StageState)> {
        self.run
            .read()
            .outcomes
            .iter()
            .map(|o| (o.stage.clone(), o.state))
            .collect()
    }

    pub fn with_run<R>(&self, f: impl FnOnce(&Run) -> R) -> R {
        f(&self.run.read())
    }

    pub(crate) fn any_failed(&self) -> bool {
        self.run.read().any_failed()
    }

    pub(crate) fn finish(&self) {
        let mut run = self.run.write();
        run.completed_at = Some(Utc::now());
        if run.cancel_reason.is_none() {
            run.cancel_reason = self.cancel.reason();
        }
    }

    /// Move a stage to `to`, rejecting transitions outside the state machine.
    pub(crate) fn transition(
        &self,
        position: usize,
        to: StageState,
        failure: Option<FailureReason>,
    ) -> Result<Event> {
        let mut run = self.run.write();
        let outcome = run
            .outcomes
            .get_mut(position)
            .ok_or_else(|| Error::Internal(format!("no stage at position {position}")))?;
        apply(self.id, outcome, to, failure)
    }

    pub(crate) fn assign(&self, position: usize, worker: &WorkerId) -> Result<Event> {
        let mut run = self.run.write();
        let outcome = run
            .outcomes
            .get_mut(position)
            .ok_or_else(|| Error::Internal(format!("no stage at position {position}")))?;
        let event = apply(self.id, outcome, StageState::Assigned, None)?;
        outcome.worker = Some(worker.clone());
        Ok(event)
    }

    pub(crate) fn complete(&self, position: usize, execution: StageExecution) -> Result<Event> {
        let mut run = self.run.write();
        let outcome = run
            .outcomes
            .get_mut(position)
            .ok_or_else(|| Error::Internal(format!("no stage at position {position}")))?;
        let event = apply(self.id, outcome, execution.state, execution.failure)?;
        outcome.started_at = Some(execution.started_at);
        outcome.completed_at = Some(execution.completed_at);
        outcome.duration_ms = Some(execution.duration_ms);
        outcome.artifacts = execution.artifacts;
        Ok(event)
    }
}

fn apply(
    run_id: RunId,
    outcome: &mut StageOutcome,
    to: StageState,
    failure: Option<FailureReason>,
) -> Result<Event> {
    let from = outcome.state;
    if !from.can_transition_to(to) {
        return Err(Error::Internal(format!(
            "illegal transition for stage `{}`: {from} -> {to}",
            outcome.stage
        )));
    }

    let now = Utc::now();
    outcome.state = to;
    outcome.failure = failure.clone();
    match to {
        StageState::Running => outcome.started_at = Some(now),
        s if s.is_terminal() => outcome.completed_at = Some(now),
        _ => {}
    }

    Ok(Event::StageTransitioned(StageTransitionedPayload {
        run_id,
        stage: outcome.stage.clone(),
        from,
        to,
        failure,
        at: now,
    }))
}

impl std::fmt::Debug for RunHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunHandle")
            .field("id", &self.id)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::StageGraphBuilder;
    use keel_core::predicate::Predicate;
    use keel_core::stage::Stage;
    use keel_core::worker::WorkerSelector;
    use std::collections::BTreeMap;

    fn handle() -> RunHandle {
        let stage = Stage {
            id: StageId::new("only"),
            position: 0,
            commands: vec!["true".to_string()],
            predicate: Predicate::Always,
            selector: WorkerSelector::new(),
            env: BTreeMap::new(),
            artifact_paths: Vec::new(),
            timeout_minutes: None,
            priority: 0,
            concurrency: None,
        };
        let graph = StageGraphBuilder::default().build(vec![stage], &[]).unwrap();
        RunHandle::new(Run::new(None, graph, RunContext::new()))
    }

    #[test]
    fn test_state_machine_is_enforced() {
        let handle = handle();
        assert!(handle.transition(0, StageState::Running, None).is_err());

        handle.assign(0, &WorkerId::new("w1")).unwrap();
        handle.transition(0, StageState::Running, None).unwrap();
        assert_eq!(handle.state(0), Some(StageState::Running));
        assert!(handle.transition(0, StageState::Skipped, None).is_err());

        handle.with_run(|run| {
            assert_eq!(run.outcomes[0].worker, Some(WorkerId::new("w1")));
            assert!(run.outcomes[0].started_at.is_some());
        });
    }

    #[test]
    fn test_cancel_records_first_reason() {
        let handle = handle();
        handle.cancel("ctrl-c");
        handle.clone().cancel("timeout");
        assert!(handle.token().is_cancelled());
        assert_eq!(
            handle.with_run(|run| run.cancel_reason.clone()),
            Some("ctrl-c".to_string())
        );
    }
}
