//! Stage execution: a stage's command sequence on its assigned worker.

use crate::cancellation::CancellationToken;
use crate::runner::{CommandRequest, Dispatcher, OutputLine, OutputStream};
use chrono::{DateTime, Utc};
use keel_core::RunId;
use keel_core::artifact::Artifact;
use keel_core::run::{FailureReason, StageState};
use keel_core::stage::Stage;
use keel_core::worker::Worker;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Outcome of one stage execution.
#[derive(Debug, Clone)]
pub struct StageExecution {
    /// `Succeeded` or `Failed`.
    pub state: StageState,
    pub failure: Option<FailureReason>,
    pub artifacts: Vec<Artifact>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl StageExecution {
    pub fn succeeded(&self) -> bool {
        self.state == StageState::Succeeded
    }
}

pub struct StageExecutor {
    dispatcher: Arc<dyn Dispatcher>,
    default_timeout: Option<Duration>,
}

impl StageExecutor {
    pub fn new(dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self {
            dispatcher,
            default_timeout: None,
        }
    }

    /// Timeout for stages that declare none.
    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Run `stage` on `worker`.
    ///
    /// Commands run in order and the first non-zero exit fails the stage.
    /// Declared artifacts are collected afterwards whatever the command
    /// outcome; a pattern matching nothing fails an otherwise successful
    /// stage. Collection shares the stage's timeout and stops on
    /// cancellation. Cancellation and timeouts drop the in-flight command.
    pub async fn execute(
        &self,
        run_id: RunId,
        stage: &Stage,
        worker: &Worker,
        cancel: &CancellationToken,
    ) -> StageExecution {
        let started_at = Utc::now();
        let start = Instant::now();
        let timeout = stage.timeout().or(self.default_timeout);

        info!(%run_id, stage = %stage.id, worker = %worker.id, commands = stage.commands.len(), "Executing stage");

        let commands = self.run_commands(run_id, stage, worker);
        let mut result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(FailureReason::Cancelled),
            result = with_deadline(timeout, Duration::ZERO, commands) => result,
        };

        let mut artifacts = Vec::new();
        if result != Err(FailureReason::Cancelled) {
            let collection = async { Ok::<_, FailureReason>(self.collect_artifacts(stage, worker).await) };
            let collected = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(FailureReason::Cancelled),
                collected = with_deadline(timeout, start.elapsed(), collection) => collected,
            };
            let failure = match collected {
                Ok((files, failure)) => {
                    artifacts = files;
                    failure
                }
                Err(reason) => {
                    warn!(stage = %stage.id, reason = %reason, "Artifact collection interrupted");
                    Some(reason)
                }
            };
            if let Some(reason) = failure
                && result.is_ok()
            {
                result = Err(reason);
            }
        }

        let duration_ms = start.elapsed().as_millis() as u64;
        let (state, failure) = match result {
            Ok(()) => {
                info!(stage = %stage.id, duration_ms, artifacts = artifacts.len(), "Stage succeeded");
                (StageState::Succeeded, None)
            }
            Err(reason) => {
                warn!(stage = %stage.id, duration_ms, reason = %reason, "Stage failed");
                (StageState::Failed, Some(reason))
            }
        };

        StageExecution {
            state,
            failure,
            artifacts,
            started_at,
            completed_at: Utc::now(),
            duration_ms,
        }
    }

    /// Artifacts for every declared pattern, plus the first collection failure.
    async fn collect_artifacts(
        &self,
        stage: &Stage,
        worker: &Worker,
    ) -> (Vec<Artifact>, Option<FailureReason>) {
        let mut artifacts = Vec::new();
        let mut failure = None;
        for pattern in &stage.artifact_paths {
            match self.dispatcher.collect_artifacts(worker, &stage.id, pattern).await {
                Ok(files) if files.is_empty() => {
                    warn!(stage = %stage.id, pattern = %pattern, "Declared artifact not found");
                    failure.get_or_insert(FailureReason::MissingArtifact {
                        pattern: pattern.clone(),
                    });
                }
                Ok(files) => artifacts.extend(
                    files
                        .into_iter()
                        .map(|f| Artifact::new(stage.id.clone(), pattern.clone(), f.path, f.data)),
                ),
                Err(e) => {
                    warn!(stage = %stage.id, pattern = %pattern, error = %e, "Artifact collection failed");
                    failure.get_or_insert(FailureReason::Dispatch {
                        message: e.to_string(),
                    });
                }
            }
        }
        (artifacts, failure)
    }

    async fn run_commands(
        &self,
        run_id: RunId,
        stage: &Stage,
        worker: &Worker,
    ) -> Result<(), FailureReason> {
        for (index, command) in stage.commands.iter().enumerate() {
            let mut env = stage.env.clone();
            env.insert("KEEL_RUN_ID".to_string(), run_id.to_string());
            env.insert("KEEL_STAGE".to_string(), stage.id.to_string());
            env.insert("KEEL_WORKER".to_string(), worker.id.to_string());
            env.insert("KEEL_COMMAND_INDEX".to_string(), index.to_string());

            let request = CommandRequest {
                run_id,
                stage: stage.id.clone(),
                worker: worker.clone(),
                index,
                command: command.clone(),
                env,
            };

            let (tx, rx) = mpsc::channel(256);
            let (result, _) = tokio::join!(
                self.dispatcher.run_command(&request, tx),
                forward_output(rx, &request)
            );

            match result {
                Ok(r) if r.success() => {
                    debug!(stage = %stage.id, index, duration_ms = r.duration_ms, "Command succeeded");
                }
                Ok(r) => {
                    return Err(FailureReason::CommandFailed {
                        index,
                        exit_code: r.exit_code,
                    });
                }
                Err(e) => {
                    return Err(FailureReason::Dispatch {
                        message: e.to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Run `work` within what is left of `timeout` after `elapsed`.
async fn with_deadline<F, T>(
    timeout: Option<Duration>,
    elapsed: Duration,
    work: F,
) -> Result<T, FailureReason>
where
    F: Future<Output = Result<T, FailureReason>>,
{
    match timeout {
        Some(limit) => tokio::time::timeout(limit.saturating_sub(elapsed), work)
            .await
            .unwrap_or(Err(FailureReason::TimedOut {
                after_secs: limit.as_secs(),
            })),
        None => work.await,
    }
}

async fn forward_output(mut rx: mpsc::Receiver<OutputLine>, request: &CommandRequest) {
    while let Some(line) = rx.recv().await {
        let stream = match line.stream {
            OutputStream::Stdout => "stdout",
            OutputStream::Stderr => "stderr",
        };
        debug!(
            stage = %request.stage,
            index = request.index,
            stream,
            line = line.line_number,
            "{}",
            line.content
        );
    }
}
