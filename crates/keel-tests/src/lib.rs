//! Scenario test infrastructure for Keel CI.
//!
//! Runs pipelines end to end against a [`ScriptedDispatcher`] (or the real
//! shell dispatcher) and records every event on a [`MemoryEventBus`] so tests
//! can assert on the transition timeline.
//!
//! # Usage
//!
//! ```ignore
//! use keel_tests::{ContextFixture, Harness, PipelineFixture, ScriptedDispatcher, WorkerFixture};
//!
//! #[tokio::test]
//! async fn test_something() {
//!     let harness = Harness::new(WorkerFixture::production(2), ScriptedDispatcher::new());
//!     let report = harness.run(&PipelineFixture::rust_ci(), ContextFixture::upstream()).await;
//! }
//! ```

pub mod dispatcher;
pub mod events;
pub mod fixtures;
pub mod helpers;

pub use dispatcher::ScriptedDispatcher;
pub use events::{MemoryEventBus, Timeline};
pub use fixtures::*;
pub use helpers::*;

/// Initialize test logging (call once per test binary).
pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_env("KEEL_LOG")
                .unwrap_or_else(|_| EnvFilter::new("warn,keel_scheduler=debug")),
        )
        .with_test_writer()
        .try_init();
}
