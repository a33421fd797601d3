//! Dispatcher whose behaviour is scripted per stage.

use async_trait::async_trait;
use globset::Glob;
use keel_core::worker::Worker;
use keel_core::{Error, Result, StageId, WorkerId};
use keel_runner::{CollectedFile, CommandRequest, CommandResult, Dispatcher, OutputLine, OutputStream};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::trace;

#[derive(Debug, Clone, Default)]
struct StageScript {
    exit_code: i32,
    delay: Option<Duration>,
    files: Vec<CollectedFile>,
}

/// Stands in for the execution collaborator.
///
/// Every command of a stage sleeps for the stage's delay and exits with the
/// stage's exit code (0 unless scripted). Artifact collection returns the
/// files scripted for the stage that match the pattern. Tracks how many
/// commands were in flight at once.
pub struct ScriptedDispatcher {
    scripts: Mutex<HashMap<String, StageScript>>,
    default_delay: Duration,
    requests: Mutex<Vec<CommandRequest>>,
    in_flight: AtomicUsize,
    high_water: AtomicUsize,
}

impl ScriptedDispatcher {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            default_delay: Duration::from_millis(20),
            requests: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            high_water: AtomicUsize::new(0),
        }
    }

    /// Delay for stages without their own.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.default_delay = delay;
        self
    }

    /// Commands of `stage` exit with `exit_code`.
    pub fn fail(self, stage: &str, exit_code: i32) -> Self {
        self.script(stage, |s| s.exit_code = exit_code);
        self
    }

    pub fn delay(self, stage: &str, delay: Duration) -> Self {
        self.script(stage, |s| s.delay = Some(delay));
        self
    }

    /// `stage` leaves `path` behind on its worker.
    pub fn produce(self, stage: &str, path: &str, data: &[u8]) -> Self {
        self.script(stage, |s| {
            s.files.push(CollectedFile {
                path: path.to_string(),
                data: data.to_vec(),
            })
        });
        self
    }

    fn script(&self, stage: &str, f: impl FnOnce(&mut StageScript)) {
        f(self.scripts.lock().entry(stage.to_string()).or_default());
    }

    /// Most commands ever running at the same time.
    pub fn high_water_mark(&self) -> usize {
        self.high_water.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Every command request, in start order.
    pub fn requests(&self) -> Vec<CommandRequest> {
        self.requests.lock().clone()
    }

    /// Stages in the order their first command started.
    pub fn started(&self) -> Vec<StageId> {
        let mut seen = Vec::new();
        for request in self.requests.lock().iter() {
            if !seen.contains(&request.stage) {
                seen.push(request.stage.clone());
            }
        }
        seen
    }

    pub fn ran(&self, stage: &str) -> bool {
        self.requests.lock().iter().any(|r| r.stage.as_str() == stage)
    }

    pub fn worker_for(&self, stage: &str) -> Option<WorkerId> {
        self.requests
            .lock()
            .iter()
            .find(|r| r.stage.as_str() == stage)
            .map(|r| r.worker.id.clone())
    }
}

impl Default for ScriptedDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements the in-flight counter however the command future ends.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Dispatcher for ScriptedDispatcher {
    async fn run_command(
        &self,
        request: &CommandRequest,
        output_tx: mpsc::Sender<OutputLine>,
    ) -> Result<CommandResult> {
        let script = self
            .scripts
            .lock()
            .get(request.stage.as_str())
            .cloned()
            .unwrap_or_default();
        self.requests.lock().push(request.clone());

        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlight(&self.in_flight);
        self.high_water.fetch_max(running, Ordering::SeqCst);
        trace!(stage = %request.stage, worker = %request.worker.id, running, "Scripted command");

        let start = Instant::now();
        let _ = output_tx
            .send(OutputLine {
                stream: OutputStream::Stdout,
                content: format!("+ {}", request.command),
                line_number: 1,
                timestamp: chrono::Utc::now(),
            })
            .await;
        tokio::time::sleep(script.delay.unwrap_or(self.default_delay)).await;

        Ok(CommandResult {
            exit_code: script.exit_code,
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }

    async fn collect_artifacts(
        &self,
        _worker: &Worker,
        stage: &StageId,
        pattern: &str,
    ) -> Result<Vec<CollectedFile>> {
        let matcher = Glob::new(pattern)
            .map_err(|e| Error::Dispatch(e.to_string()))?
            .compile_matcher();
        Ok(self
            .scripts
            .lock()
            .get(stage.as_str())
            .map(|s| {
                s.files
                    .iter()
                    .filter(|f| matcher.is_match(&f.path))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}
