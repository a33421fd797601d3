//! Stage execution engine for Keel CI.

pub mod artifacts;
pub mod cancellation;
pub mod executor;
pub mod runner;
pub mod shell;

pub use cancellation::CancellationToken;
pub use executor::{StageExecution, StageExecutor};
pub use runner::{
    CollectedFile, CommandRequest, CommandResult, Dispatcher, OutputLine, OutputStream,
};
pub use shell::{ShellConfig, ShellDispatcher};
