//! Local adapters for the event bus and report sink ports.

use async_trait::async_trait;
use console::style;
use keel_core::Result;
use keel_core::events::Event;
use keel_core::ports::{EventBus, ReportSink};
use keel_core::run::{RunReport, StageState, Verdict};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info};

/// Event bus that writes events to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogEventBus;

#[async_trait]
impl EventBus for LogEventBus {
    async fn publish(&self, event: Event) -> Result<()> {
        match &event {
            Event::StageTransitioned(p) => info!(
                subject = %event.subject(),
                stage = %p.stage,
                from = %p.from,
                to = %p.to,
                "Stage transitioned"
            ),
            _ => debug!(
                subject = %event.subject(),
                event = %serde_json::to_string(&event)?,
                "Event"
            ),
        }
        Ok(())
    }
}

/// Prints a stage summary to stdout.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleSink;

#[async_trait]
impl ReportSink for ConsoleSink {
    async fn deliver(&self, report: &RunReport) -> Result<()> {
        println!();
        for stage in &report.stages {
            let marker = match stage.state {
                StageState::Succeeded => style("✓").green(),
                StageState::Skipped => style("-").dim(),
                StageState::Cancelled => style("!").yellow(),
                _ => style("✗").red(),
            };
            let detail = match (&stage.failure, stage.duration_ms) {
                (Some(failure), _) => format!("{} ({})", stage.state, failure),
                (None, Some(ms)) => format!("{} in {}ms", stage.state, ms),
                (None, None) => stage.state.to_string(),
            };
            let worker = stage
                .worker
                .as_ref()
                .map(|w| format!(" on {}", w))
                .unwrap_or_default();
            println!("  {} {}{}: {}", marker, style(&stage.stage).bold(), worker, detail);
        }

        let verdict = match report.verdict {
            Verdict::Succeeded => style(report.verdict.to_string()).green().bold(),
            Verdict::Failed => style(report.verdict.to_string()).red().bold(),
            Verdict::Cancelled => style(report.verdict.to_string()).yellow().bold(),
        };
        println!();
        println!(
            "{} Run {} {} in {}ms ({} artifacts, {} bytes)",
            style("▶").cyan(),
            report.run_id,
            verdict,
            report.duration_ms,
            report.artifacts.len(),
            report.artifacts.total_bytes()
        );
        if let Some(reason) = &report.cancel_reason {
            println!("  {} cancelled: {}", style("!").yellow(), reason);
        }
        Ok(())
    }
}

/// Writes the report as pretty JSON.
#[derive(Debug, Clone)]
pub struct JsonFileSink {
    path: PathBuf,
}

impl JsonFileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ReportSink for JsonFileSink {
    async fn deliver(&self, report: &RunReport) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, serde_json::to_vec_pretty(report)?).await?;
        info!(path = %self.path.display(), "Report written");
        Ok(())
    }
}

/// Copies collected artifacts to `<dir>/<stage>/<path>`.
#[derive(Debug, Clone)]
pub struct ArtifactDirSink {
    dir: PathBuf,
}

impl ArtifactDirSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn target(&self, stage: &str, path: &str) -> PathBuf {
        let mut target = self.dir.join(sanitize(stage));
        target.extend(
            Path::new(path)
                .components()
                .filter_map(|c| match c {
                    Component::Normal(part) => Some(part),
                    _ => None,
                }),
        );
        target
    }
}

#[async_trait]
impl ReportSink for ArtifactDirSink {
    async fn deliver(&self, report: &RunReport) -> Result<()> {
        for (key, artifact) in report.artifacts.iter() {
            let target = self.target(artifact.stage.as_str(), &artifact.path);
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&target, &artifact.data).await?;
            debug!(%key, path = %target.display(), "Artifact saved");
        }
        if !report.artifacts.is_empty() {
            info!(
                count = report.artifacts.len(),
                dir = %self.dir.display(),
                "Artifacts saved"
            );
        }
        Ok(())
    }
}

/// Directory name for a stage label. Bytes outside `[A-Za-z0-9.-]`, `_` and a
/// leading `.` are written as `_XX` hex so distinct labels never share a
/// directory.
fn sanitize(label: &str) -> String {
    let mut name = String::with_capacity(label.len());
    for (i, byte) in label.bytes().enumerate() {
        let keep = byte.is_ascii_alphanumeric() || byte == b'-' || (byte == b'.' && i > 0);
        if keep {
            name.push(char::from(byte));
        } else {
            name.push_str(&format!("_{byte:02X}"));
        }
    }
    name
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use keel_core::artifact::{Artifact, ArtifactCollection};
    use keel_core::run::StageOutcome;
    use keel_core::{RunId, StageId};

    fn report() -> RunReport {
        let mut artifacts = ArtifactCollection::new();
        artifacts
            .insert(Artifact::new(
                StageId::new("Build docs"),
                "target/*.lock",
                "target/Cargo.lock",
                b"lock".to_vec(),
            ))
            .unwrap();
        let mut outcome = StageOutcome::pending(StageId::new("Build docs"), 0);
        outcome.state = StageState::Succeeded;
        let now = Utc::now();
        RunReport {
            run_id: RunId::new(),
            name: Some("docs".to_string()),
            verdict: Verdict::Succeeded,
            stages: vec![outcome],
            artifacts,
            cancel_reason: None,
            started_at: now,
            completed_at: now,
            duration_ms: 0,
        }
    }

    #[tokio::test]
    async fn test_json_sink_writes_report() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/report.json");
        JsonFileSink::new(&path).deliver(&report()).await.unwrap();

        let json: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(json["verdict"], "succeeded");
        assert_eq!(json["stages"][0]["stage"], "Build docs");
    }

    #[tokio::test]
    async fn test_artifact_sink_copies_files() {
        let dir = tempfile::tempdir().unwrap();
        ArtifactDirSink::new(dir.path())
            .deliver(&report())
            .await
            .unwrap();

        let copied = dir.path().join("Build_20docs/target/Cargo.lock");
        assert_eq!(std::fs::read(copied).unwrap(), b"lock");
    }

    #[test]
    fn test_artifact_target_stays_inside_dir() {
        let sink = ArtifactDirSink::new("/tmp/artifacts");
        assert_eq!(
            sink.target("deploy/prod", "../../etc/passwd"),
            PathBuf::from("/tmp/artifacts/deploy_2Fprod/etc/passwd")
        );
    }

    #[tokio::test]
    async fn test_similar_labels_get_separate_directories() {
        let dir = tempfile::tempdir().unwrap();
        let mut report = report();
        report.artifacts = ArtifactCollection::new();
        for (stage, data) in [("Build docs", "first"), ("Build_docs", "second")] {
            report
                .artifacts
                .insert(Artifact::new(StageId::new(stage), "a.txt", "a.txt", data.as_bytes().to_vec()))
                .unwrap();
        }

        ArtifactDirSink::new(dir.path()).deliver(&report).await.unwrap();

        assert_eq!(std::fs::read(dir.path().join("Build_20docs/a.txt")).unwrap(), b"first");
        assert_eq!(std::fs::read(dir.path().join("Build_5Fdocs/a.txt")).unwrap(), b"second");
    }

    #[test]
    fn test_sanitize_escapes_dot_dirs() {
        assert_eq!(sanitize(".."), "_2E.");
        assert_eq!(sanitize("v1.2"), "v1.2");
        assert_ne!(sanitize("a b"), sanitize("a_20b"));
    }
}
