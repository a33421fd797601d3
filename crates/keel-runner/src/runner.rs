//! Dispatch collaborator trait and types.

use async_trait::async_trait;
use keel_core::worker::Worker;
use keel_core::{Result, RunId, StageId};
use std::collections::BTreeMap;
use tokio::sync::mpsc;

/// Output line from a running command.
#[derive(Debug, Clone)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub content: String,
    pub line_number: u32,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// One command of a stage, bound to the worker it runs on.
#[derive(Debug, Clone)]
pub struct CommandRequest {
    pub run_id: RunId,
    pub stage: StageId,
    pub worker: Worker,
    /// Zero-based index within the stage's command list.
    pub index: usize,
    pub command: String,
    /// Resolved stage environment plus the `KEEL_*` variables.
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandResult {
    pub exit_code: i32,
    pub duration_ms: u64,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// A file read back from a worker after its stage ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectedFile {
    /// `/`-separated path relative to the worker's working directory.
    pub path: String,
    pub data: Vec<u8>,
}

/// Runs commands on workers and retrieves their artifacts.
///
/// Implementations must stop the underlying command when the returned future
/// is dropped; the executor relies on this for timeouts and cancellation.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Run one command, streaming output to the provided channel.
    async fn run_command(
        &self,
        request: &CommandRequest,
        output_tx: mpsc::Sender<OutputLine>,
    ) -> Result<CommandResult>;

    /// Files on `worker` matching `pattern` after `stage` ran. An empty
    /// result means nothing matched.
    async fn collect_artifacts(
        &self,
        worker: &Worker,
        stage: &StageId,
        pattern: &str,
    ) -> Result<Vec<CollectedFile>>;
}
