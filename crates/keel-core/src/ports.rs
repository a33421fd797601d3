//! Port traits (hexagonal architecture).
//!
//! These traits define the interfaces between the orchestration core and
//! its external collaborators.

use crate::Result;
use crate::events::Event;
use crate::run::RunReport;
use async_trait::async_trait;

/// Event bus for publishing run lifecycle events.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish an event.
    async fn publish(&self, event: Event) -> Result<()>;
}

/// Event bus that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEventBus;

#[async_trait]
impl EventBus for NoopEventBus {
    async fn publish(&self, _event: Event) -> Result<()> {
        Ok(())
    }
}

/// Reporting/notification collaborator receiving the final report.
#[async_trait]
pub trait ReportSink: Send + Sync {
    async fn deliver(&self, report: &RunReport) -> Result<()>;
}
