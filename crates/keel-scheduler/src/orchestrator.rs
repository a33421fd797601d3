//! End-to-end data flow: resolve, build, schedule, aggregate, report.

use crate::aggregate::aggregate;
use crate::graph::StageGraphBuilder;
use crate::run::{Run, RunHandle};
use crate::scheduler::Scheduler;
use chrono::Utc;
use keel_core::events::{Event, RunCompletedPayload};
use keel_core::pipeline::PipelineDefinition;
use keel_core::ports::ReportSink;
use keel_core::predicate::RunContext;
use keel_core::resolver::resolve;
use keel_core::run::RunReport;
use keel_core::Result;
use std::sync::Arc;
use tracing::{info, warn};

pub struct Orchestrator {
    scheduler: Scheduler,
    sinks: Vec<Arc<dyn ReportSink>>,
}

impl Orchestrator {
    pub fn new(scheduler: Scheduler) -> Self {
        Self {
            scheduler,
            sinks: Vec::new(),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn ReportSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Resolve the definition and build the run, without starting it.
    pub fn prepare(&self, definition: &PipelineDefinition, context: RunContext) -> Result<RunHandle> {
        self.scheduler.config().validate()?;
        let unknown = context.unknown_fields();
        if !unknown.is_empty() {
            warn!(fields = ?unknown, "Run context has fields no predicate can reference");
        }

        let resolved = resolve(definition)?;
        let graph = StageGraphBuilder::new(self.scheduler.config().default_barrier)
            .build(resolved.stages, &resolved.barriers)?;
        Ok(RunHandle::new(Run::new(resolved.name, graph, context)))
    }

    /// Schedule a prepared run to completion and deliver its report.
    pub async fn execute(&self, handle: &RunHandle) -> Result<RunReport> {
        self.scheduler.schedule(handle).await?;
        let report = handle.with_run(aggregate)?;

        info!(
            run_id = %report.run_id,
            verdict = %report.verdict,
            duration_ms = report.duration_ms,
            artifacts = report.artifacts.len(),
            "Run completed"
        );
        let event = Event::RunCompleted(RunCompletedPayload {
            run_id: report.run_id,
            verdict: report.verdict,
            duration_ms: report.duration_ms,
            completed_at: Utc::now(),
        });
        if let Err(e) = self.scheduler.event_bus().publish(event).await {
            warn!(error = %e, "Failed to publish run completion");
        }

        for sink in &self.sinks {
            if let Err(e) = sink.deliver(&report).await {
                warn!(run_id = %report.run_id, error = %e, "Report delivery failed");
            }
        }

        Ok(report)
    }

    pub async fn run(&self, definition: &PipelineDefinition, context: RunContext) -> Result<RunReport> {
        let handle = self.prepare(definition, context)?;
        self.execute(&handle).await
    }
}
