//! Main scheduler orchestration.
//!
//! Batches run strictly in order. Inside a batch, stages whose predicate is
//! false are skipped up front; the rest wait in a ready queue until a
//! matching worker is idle, and run concurrently up to the number of such
//! workers. The next batch starts only once every stage of the current one
//! is terminal.

use crate::graph::Batch;
use crate::pool::{WorkerLease, WorkerPool};
use crate::queue::{QueuedStage, ReadyQueue};
use crate::run::RunHandle;
use chrono::Utc;
use keel_core::events::{
    BatchCompletedPayload, BatchStartedPayload, Event, RunStartedPayload, StageAssignedPayload,
};
use keel_core::pipeline::BarrierPolicy;
use keel_core::ports::EventBus;
use keel_core::predicate::RunContext;
use keel_core::run::{FailureReason, StageState};
use keel_core::stage::Stage;
use keel_core::{Error, Result};
use keel_runner::{Dispatcher, StageExecution, StageExecutor};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Cap on concurrently running stages, on top of worker availability.
    pub max_parallel: Option<usize>,
    /// Policy for `wait` steps that do not name one.
    pub default_barrier: BarrierPolicy,
    /// Timeout for stages that declare none.
    pub default_timeout: Option<Duration>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_parallel: None,
            default_barrier: BarrierPolicy::AwaitCompletion,
            default_timeout: None,
        }
    }
}

impl SchedulerConfig {
    /// Reject limits under which no stage could ever start or finish.
    pub fn validate(&self) -> Result<()> {
        if self.max_parallel == Some(0) {
            return Err(Error::Configuration("max_parallel must be at least 1".to_string()));
        }
        if self.default_timeout == Some(Duration::ZERO) {
            return Err(Error::Configuration("default timeout must be positive".to_string()));
        }
        Ok(())
    }
}

type TaskOutput = Result<Option<StageExecution>>;

/// The scheduler service.
pub struct Scheduler {
    pool: Arc<WorkerPool>,
    executor: Arc<StageExecutor>,
    event_bus: Arc<dyn EventBus>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        pool: Arc<WorkerPool>,
        dispatcher: Arc<dyn Dispatcher>,
        event_bus: Arc<dyn EventBus>,
        config: SchedulerConfig,
    ) -> Self {
        let executor = StageExecutor::new(dispatcher).with_default_timeout(config.default_timeout);
        Self {
            pool,
            executor: Arc::new(executor),
            event_bus,
            config,
        }
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn event_bus(&self) -> &Arc<dyn EventBus> {
        &self.event_bus
    }

    /// Fail if a stage that will run has no worker in the pool able to take it.
    pub fn check_starvation(&self, handle: &RunHandle) -> Result<()> {
        let context = handle.context();
        for stage in handle.graph().stages() {
            if stage.predicate.evaluate(&context) && !self.pool.can_ever_satisfy(&stage.selector) {
                return Err(Error::SchedulingStarvation {
                    stage: stage.id.to_string(),
                    selector: stage.selector.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Drive every stage of the run to a terminal state.
    pub async fn schedule(&self, handle: &RunHandle) -> Result<()> {
        self.config.validate()?;
        self.check_starvation(handle)?;

        let graph = Arc::clone(handle.graph());
        let context = handle.context();
        let run_id = handle.id();

        info!(
            %run_id,
            stages = graph.stages().len(),
            batches = graph.batches().len(),
            workers = self.pool.len(),
            "Run started"
        );
        self.emit(Event::RunStarted(RunStartedPayload {
            run_id,
            name: handle.with_run(|run| run.name.clone()),
            stage_count: graph.stages().len(),
            batch_count: graph.batches().len(),
            started_at: Utc::now(),
        }))
        .await;

        for batch in graph.batches() {
            if handle.token().is_cancelled() {
                info!(%run_id, batch = batch.index, "Run cancelled, not starting remaining batches");
                self.cancel_pending(handle, batch.index).await?;
                break;
            }
            if batch.gate == Some(BarrierPolicy::RequireSuccess) && handle.any_failed() {
                warn!(%run_id, batch = batch.index, "Earlier stage failed, cancelling stages past the barrier");
                self.cancel_pending(handle, batch.index).await?;
                break;
            }

            info!(%run_id, batch = batch.index, stages = batch.stages.len(), "Batch started");
            self.emit(Event::BatchStarted(BatchStartedPayload {
                run_id,
                batch: batch.index,
                stages: batch
                    .stages
                    .iter()
                    .filter_map(|&p| graph.stage(p).map(|s| s.id.clone()))
                    .collect(),
                gate: batch.gate,
            }))
            .await;

            self.run_batch(handle, batch, &context).await?;

            let completed = batch_counts(handle, batch);
            info!(
                %run_id,
                batch = batch.index,
                succeeded = completed.succeeded,
                failed = completed.failed,
                skipped = completed.skipped,
                cancelled = completed.cancelled,
                "Batch completed"
            );
            self.emit(Event::BatchCompleted(completed)).await;
        }

        handle.finish();
        Ok(())
    }

    async fn run_batch(&self, handle: &RunHandle, batch: &Batch, context: &RunContext) -> Result<()> {
        let graph = Arc::clone(handle.graph());
        let token = handle.token().clone();
        let mut queue = ReadyQueue::new(self.config.max_parallel);

        for &position in &batch.stages {
            let stage = stage_at(&graph, position)?;
            if stage.predicate.evaluate(context) {
                queue.enqueue(stage);
            } else {
                debug!(stage = %stage.id, "Predicate is false, skipping stage");
                let event = handle.transition(position, StageState::Skipped, None)?;
                self.emit(event).await;
            }
        }

        let mut tasks: JoinSet<TaskOutput> = JoinSet::new();
        let mut in_flight: HashMap<tokio::task::Id, QueuedStage> = HashMap::new();
        let mut cancel_seen = false;

        loop {
            // Registered before trying to acquire, so a release in between still wakes us.
            let released = self.pool.released();
            tokio::pin!(released);
            released.as_mut().enable();

            if token.is_cancelled() {
                if !cancel_seen {
                    cancel_seen = true;
                    for position in queue.drain() {
                        let event = handle.transition(position, StageState::Cancelled, None)?;
                        self.emit(event).await;
                    }
                }
            } else {
                while let Some((queued, lease)) = queue.dequeue_with(|p| {
                    graph
                        .stage(p)
                        .and_then(|stage| self.pool.try_acquire(&stage.selector))
                }) {
                    let position = queued.position;
                    if !graph.is_ready(position, |p| handle.state(p).is_some_and(|s| s.is_terminal())) {
                        return Err(Error::Internal(format!(
                            "stage at position {position} started before its barrier cleared"
                        )));
                    }

                    let stage = stage_at(&graph, position)?.clone();
                    let worker = lease.worker().id.clone();
                    let transition = handle.assign(position, &worker)?;
                    info!(stage = %stage.id, %worker, "Stage assigned");
                    self.emit(Event::StageAssigned(StageAssignedPayload {
                        run_id: handle.id(),
                        stage: stage.id.clone(),
                        worker,
                        assigned_at: Utc::now(),
                    }))
                    .await;
                    self.emit(transition).await;

                    let id = tasks.spawn(self.stage_task(handle.clone(), stage, lease)).id();
                    in_flight.insert(id, queued);
                }
            }

            if tasks.is_empty() && queue.is_empty() {
                break;
            }

            tokio::select! {
                Some(joined) = tasks.join_next_with_id(), if !tasks.is_empty() => {
                    let (id, output) = match joined {
                        Ok((id, output)) => (id, Ok(output)),
                        Err(e) => (e.id(), Err(e)),
                    };
                    if let Some(queued) = in_flight.remove(&id) {
                        queue.complete(&queued);
                        self.record(handle, queued.position, output).await?;
                    }
                }
                _ = &mut released => {}
                _ = token.cancelled(), if !cancel_seen => {}
            }
        }

        Ok(())
    }

    fn stage_task(
        &self,
        handle: RunHandle,
        stage: Stage,
        lease: WorkerLease,
    ) -> impl Future<Output = TaskOutput> + Send + 'static {
        let executor = Arc::clone(&self.executor);
        let bus = Arc::clone(&self.event_bus);

        async move {
            let token = handle.token().clone();
            if token.is_cancelled() {
                return Ok(None);
            }

            let event = handle.transition(stage.position, StageState::Running, None)?;
            emit(bus.as_ref(), event).await;

            let execution = executor
                .execute(handle.id(), &stage, lease.worker(), &token)
                .await;
            drop(lease);
            Ok(Some(execution))
        }
    }

    async fn record(
        &self,
        handle: &RunHandle,
        position: usize,
        output: std::result::Result<TaskOutput, JoinError>,
    ) -> Result<()> {
        match output {
            Ok(Ok(Some(execution))) => {
                let event = handle.complete(position, execution)?;
                self.emit(event).await;
            }
            Ok(Ok(None)) => {
                let event = handle.transition(position, StageState::Cancelled, None)?;
                self.emit(event).await;
            }
            Ok(Err(e)) => return Err(e),
            Err(e) => {
                warn!(position, error = %e, "Stage task did not complete");
                if handle.state(position) == Some(StageState::Assigned) {
                    let event = handle.transition(position, StageState::Running, None)?;
                    self.emit(event).await;
                }
                let event = handle.transition(
                    position,
                    StageState::Failed,
                    Some(FailureReason::Dispatch {
                        message: format!("stage task aborted: {e}"),
                    }),
                )?;
                self.emit(event).await;
            }
        }
        Ok(())
    }

    /// Cancel every still-pending stage from batch `from` onwards.
    async fn cancel_pending(&self, handle: &RunHandle, from: usize) -> Result<()> {
        let graph = Arc::clone(handle.graph());
        for batch in graph.batches().iter().skip(from) {
            for &position in &batch.stages {
                if handle.state(position) == Some(StageState::Pending) {
                    let event = handle.transition(position, StageState::Cancelled, None)?;
                    self.emit(event).await;
                }
            }
        }
        Ok(())
    }

    async fn emit(&self, event: Event) {
        emit(self.event_bus.as_ref(), event).await;
    }
}

async fn emit(bus: &dyn EventBus, event: Event) {
    let subject = event.subject();
    if let Err(e) = bus.publish(event).await {
        warn!(%subject, error = %e, "Failed to publish event");
    }
}

fn stage_at(graph: &crate::graph::StageGraph, position: usize) -> Result<&Stage> {
    graph
        .stage(position)
        .ok_or_else(|| Error::Internal(format!("no stage at position {position}")))
}

fn batch_counts(handle: &RunHandle, batch: &Batch) -> BatchCompletedPayload {
    let mut payload = BatchCompletedPayload {
        run_id: handle.id(),
        batch: batch.index,
        succeeded: 0,
        failed: 0,
        skipped: 0,
        cancelled: 0,
    };
    for &position in &batch.stages {
        match handle.state(position) {
            Some(StageState::Succeeded) => payload.succeeded += 1,
            Some(StageState::Failed) => payload.failed += 1,
            Some(StageState::Skipped) => payload.skipped += 1,
            Some(StageState::Cancelled) => payload.cancelled += 1,
            _ => {}
        }
    }
    payload
}
