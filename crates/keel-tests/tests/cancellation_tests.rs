//! Run cancellation and stage timeouts.

use keel_core::pipeline::PipelineStep;
use keel_core::run::{FailureReason, StageState, Verdict};
use keel_scheduler::SchedulerConfig;
use keel_tests::*;
use pretty_assertions::assert_eq;
use std::time::Duration;

const LONG: Duration = Duration::from_secs(10);
const DEADLINE: Duration = Duration::from_secs(5);
const POLL: Duration = Duration::from_millis(5);

#[tokio::test]
async fn test_cancel_while_running() {
    let harness = Harness::new(
        WorkerFixture::generic(2),
        ScriptedDispatcher::new().delay("slow", LONG),
    );
    let definition = PipelineFixture::batched(&[&["slow"], &["after"]], PipelineStep::wait());
    let handle = harness.prepare(&definition, ContextFixture::upstream());

    let canceller = async {
        assert!(wait_for(DEADLINE, POLL, || harness.dispatcher.in_flight() == 1).await);
        assert_eq!(
            handle.snapshot()[0].1,
            StageState::Running,
            "snapshot should show the live state"
        );
        handle.cancel("user requested");
    };
    let (report, ()) = assert_completes_within(
        async { tokio::join!(harness.orchestrator.execute(&handle), canceller) },
        DEADLINE,
    )
    .await;
    let report = report.expect("Run failed");

    let slow = report.outcome("slow").unwrap();
    assert_eq!(slow.state, StageState::Failed);
    assert_eq!(slow.failure, Some(FailureReason::Cancelled));
    assert_eq!(report.outcome("after").unwrap().state, StageState::Cancelled);
    assert!(!harness.dispatcher.ran("after"));
    assert_eq!(harness.dispatcher.in_flight(), 0);

    assert_eq!(report.verdict, Verdict::Cancelled);
    assert_eq!(report.cancel_reason.as_deref(), Some("user requested"));
}

#[tokio::test]
async fn test_cancel_before_start() {
    let harness = Harness::new(WorkerFixture::production(2), ScriptedDispatcher::new());
    let handle = harness.prepare(&PipelineFixture::rust_ci(), ContextFixture::upstream());

    handle.cancel("superseded by a newer build");
    handle.cancel("ignored");
    let report = harness
        .orchestrator
        .execute(&handle)
        .await
        .expect("Run failed");

    assert_eq!(report.verdict, Verdict::Cancelled);
    assert_eq!(report.count(StageState::Cancelled), 5);
    assert_eq!(
        report.cancel_reason.as_deref(),
        Some("superseded by a newer build")
    );
    assert!(harness.dispatcher.requests().is_empty());
}

#[tokio::test]
async fn test_cancel_drops_queued_stages() {
    let harness = Harness::new(
        WorkerFixture::generic(1),
        ScriptedDispatcher::new().with_delay(LONG),
    );
    let handle = harness.prepare(&PipelineFixture::flat(&["a", "b", "c"]), ContextFixture::upstream());

    let canceller = async {
        assert!(wait_for(DEADLINE, POLL, || harness.dispatcher.in_flight() == 1).await);
        handle.cancel("interrupted");
    };
    let (report, ()) = assert_completes_within(
        async { tokio::join!(harness.orchestrator.execute(&handle), canceller) },
        DEADLINE,
    )
    .await;
    let report = report.expect("Run failed");

    assert_eq!(report.outcome("a").unwrap().failure, Some(FailureReason::Cancelled));
    let timeline = harness.timeline();
    timeline.assert_valid_transitions();
    for queued in ["b", "c"] {
        assert_eq!(
            timeline.states_of(queued),
            vec![StageState::Pending, StageState::Cancelled]
        );
    }
    assert_eq!(report.verdict, Verdict::Cancelled);
}

#[tokio::test]
async fn test_failure_outranks_cancellation() {
    let harness = Harness::new(
        WorkerFixture::generic(2),
        ScriptedDispatcher::new().fail("bad", 1).delay("slow", LONG),
    );
    let handle = harness.prepare(&PipelineFixture::flat(&["bad", "slow"]), ContextFixture::upstream());

    let canceller = async {
        assert!(
            wait_for(DEADLINE, POLL, || {
                handle.state(0).is_some_and(|s| s.is_terminal())
            })
            .await
        );
        handle.cancel("interrupted");
    };
    let (report, ()) = assert_completes_within(
        async { tokio::join!(harness.orchestrator.execute(&handle), canceller) },
        DEADLINE,
    )
    .await;
    let report = report.expect("Run failed");

    assert_eq!(report.outcome("slow").unwrap().failure, Some(FailureReason::Cancelled));
    assert_eq!(report.verdict, Verdict::Failed);
}

#[tokio::test]
async fn test_timeout_fails_stage_and_frees_worker() {
    let config = SchedulerConfig {
        default_timeout: Some(Duration::from_millis(100)),
        ..Default::default()
    };
    let harness = Harness::with_config(
        WorkerFixture::generic(1),
        ScriptedDispatcher::new().delay("hang", LONG),
        config,
    );
    let definition = PipelineFixture::batched(&[&["hang"], &["next"]], PipelineStep::wait());

    let report = assert_completes_within(
        harness.run(&definition, ContextFixture::upstream()),
        DEADLINE,
    )
    .await
    .expect("Run failed");

    let hang = report.outcome("hang").unwrap();
    assert_eq!(hang.state, StageState::Failed);
    assert_eq!(hang.failure, Some(FailureReason::TimedOut { after_secs: 0 }));
    assert_eq!(report.outcome("next").unwrap().state, StageState::Succeeded);
    assert_eq!(report.verdict, Verdict::Failed);
}
