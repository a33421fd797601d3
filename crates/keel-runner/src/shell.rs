//! Shell-based dispatch on the local host.
//!
//! Every worker of the pool maps onto the same local working directory;
//! worker tags only drive matching.

use crate::artifacts;
use crate::runner::{CollectedFile, CommandRequest, CommandResult, Dispatcher, OutputLine, OutputStream};
use async_trait::async_trait;
use keel_core::worker::Worker;
use keel_core::{Error, Result, StageId};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct ShellConfig {
    pub working_dir: PathBuf,
    pub shell: String,
    /// Pass the orchestrator's own environment through to commands.
    pub inherit_env: bool,
    pub max_artifact_bytes: u64,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            working_dir: PathBuf::from("."),
            shell: "sh".to_string(),
            inherit_env: true,
            max_artifact_bytes: 512 * 1024 * 1024,
        }
    }
}

/// Dispatcher running commands as local `sh -c` processes.
pub struct ShellDispatcher {
    config: ShellConfig,
}

impl ShellDispatcher {
    pub fn new(config: ShellConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ShellConfig {
        &self.config
    }

    fn build_env(&self, request: &CommandRequest) -> BTreeMap<String, String> {
        let mut env: BTreeMap<String, String> = if self.config.inherit_env {
            std::env::vars().collect()
        } else {
            // PATH is kept so the shell itself still resolves.
            std::env::vars().filter(|(k, _)| k == "PATH").collect()
        };
        env.extend(request.env.clone());
        env
    }
}

impl Default for ShellDispatcher {
    fn default() -> Self {
        Self::new(ShellConfig::default())
    }
}

fn stream_lines<R>(
    reader: R,
    stream: OutputStream,
    tx: mpsc::Sender<OutputLine>,
) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        let mut line_number = 0u32;

        while let Ok(Some(line)) = lines.next_line().await {
            line_number += 1;
            let output = OutputLine {
                stream,
                content: line,
                line_number,
                timestamp: chrono::Utc::now(),
            };
            if tx.send(output).await.is_err() {
                break;
            }
        }
    })
}

#[async_trait]
impl Dispatcher for ShellDispatcher {
    async fn run_command(
        &self,
        request: &CommandRequest,
        output_tx: mpsc::Sender<OutputLine>,
    ) -> Result<CommandResult> {
        let start = std::time::Instant::now();

        info!(
            stage = %request.stage,
            worker = %request.worker.id,
            command = %request.command,
            working_dir = %self.config.working_dir.display(),
            "Executing shell command"
        );

        let mut command = Command::new(&self.config.shell);
        command
            .arg("-c")
            .arg(&request.command)
            .current_dir(&self.config.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if !self.config.inherit_env {
            command.env_clear();
        }
        command.envs(self.build_env(request));

        let mut child = command
            .spawn()
            .map_err(|e| Error::Dispatch(format!("failed to spawn `{}`: {e}", self.config.shell)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Internal("stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Internal("stderr not captured".to_string()))?;

        let stdout_handle = stream_lines(stdout, OutputStream::Stdout, output_tx.clone());
        let stderr_handle = stream_lines(stderr, OutputStream::Stderr, output_tx);

        let status = child
            .wait()
            .await
            .map_err(|e| Error::Dispatch(format!("failed to wait for process: {e}")))?;

        let _ = stdout_handle.await;
        let _ = stderr_handle.await;

        // Killed by a signal reports no code.
        let exit_code = status.code().unwrap_or(-1);
        let duration_ms = start.elapsed().as_millis() as u64;

        debug!(exit_code, duration_ms, "Command completed");

        Ok(CommandResult {
            exit_code,
            duration_ms,
        })
    }

    async fn collect_artifacts(
        &self,
        worker: &Worker,
        stage: &StageId,
        pattern: &str,
    ) -> Result<Vec<CollectedFile>> {
        let root = self.config.working_dir.clone();
        let pattern_owned = pattern.to_string();
        let max_bytes = self.config.max_artifact_bytes;

        let files = tokio::task::spawn_blocking(move || artifacts::collect(&root, &pattern_owned, max_bytes))
            .await
            .map_err(|e| Error::Internal(format!("artifact collection task failed: {e}")))??;

        debug!(%stage, worker = %worker.id, pattern, matched = files.len(), "Collected artifacts");
        Ok(files)
    }
}
