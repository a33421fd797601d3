//! Stage graph scheduling and orchestration for Keel CI.

pub mod aggregate;
pub mod graph;
pub mod orchestrator;
pub mod pool;
pub mod queue;
pub mod run;
pub mod scheduler;

pub use aggregate::aggregate;
pub use graph::{Batch, StageGraph, StageGraphBuilder};
pub use orchestrator::Orchestrator;
pub use pool::{WorkerLease, WorkerPool};
pub use run::{Run, RunHandle};
pub use scheduler::{Scheduler, SchedulerConfig};
