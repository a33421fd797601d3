//! Test helper functions and utilities.

use crate::dispatcher::ScriptedDispatcher;
use crate::events::{MemoryEventBus, Timeline};
use keel_core::pipeline::PipelineDefinition;
use keel_core::predicate::RunContext;
use keel_core::run::RunReport;
use keel_core::worker::Worker;
use keel_runner::Dispatcher;
use keel_scheduler::{Orchestrator, RunHandle, Scheduler, SchedulerConfig, WorkerPool};
use std::sync::Arc;
use std::time::Duration;

/// An orchestrator wired to a scripted dispatcher and an in-memory bus.
pub struct Harness {
    pub dispatcher: Arc<ScriptedDispatcher>,
    pub events: Arc<MemoryEventBus>,
    pub orchestrator: Orchestrator,
}

impl Harness {
    pub fn new(workers: Vec<Worker>, dispatcher: ScriptedDispatcher) -> Self {
        Self::with_config(workers, dispatcher, SchedulerConfig::default())
    }

    pub fn with_config(
        workers: Vec<Worker>,
        dispatcher: ScriptedDispatcher,
        config: SchedulerConfig,
    ) -> Self {
        let dispatcher = Arc::new(dispatcher);
        let events = Arc::new(MemoryEventBus::new());
        let orchestrator = orchestrator(workers, dispatcher.clone(), events.clone(), config);
        Self {
            dispatcher,
            events,
            orchestrator,
        }
    }

    pub async fn run(
        &self,
        definition: &PipelineDefinition,
        context: RunContext,
    ) -> keel_core::Result<RunReport> {
        self.orchestrator.run(definition, context).await
    }

    pub fn prepare(&self, definition: &PipelineDefinition, context: RunContext) -> RunHandle {
        self.orchestrator
            .prepare(definition, context)
            .expect("Failed to prepare run")
    }

    pub fn timeline(&self) -> Timeline {
        self.events.timeline()
    }
}

/// Build an orchestrator over any dispatcher.
pub fn orchestrator(
    workers: Vec<Worker>,
    dispatcher: Arc<dyn Dispatcher>,
    events: Arc<MemoryEventBus>,
    config: SchedulerConfig,
) -> Orchestrator {
    let pool = WorkerPool::new(workers).expect("Failed to create worker pool");
    Orchestrator::new(Scheduler::new(pool, dispatcher, events, config))
}

/// Wait for a condition with timeout.
pub async fn wait_for<F>(timeout: Duration, interval: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        tokio::time::sleep(interval).await;
    }
    false
}

/// Assert that a future completes within a timeout.
pub async fn assert_completes_within<F, T>(future: F, timeout: Duration) -> T
where
    F: std::future::Future<Output = T>,
{
    tokio::time::timeout(timeout, future)
        .await
        .expect("Operation timed out")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wait_for_immediate() {
        let result = wait_for(Duration::from_secs(1), Duration::from_millis(10), || true).await;
        assert!(result);
    }

    #[tokio::test]
    async fn test_wait_for_timeout() {
        let result =
            wait_for(Duration::from_millis(50), Duration::from_millis(10), || false).await;
        assert!(!result);
    }
}
