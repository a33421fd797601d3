//! Barrier ordering, barrier policies and concurrency limits.

use keel_core::pipeline::{BarrierPolicy, PipelineDefinition, PipelineStep, StageDefinition};
use keel_core::run::{StageState, Verdict};
use keel_scheduler::SchedulerConfig;
use keel_tests::*;
use pretty_assertions::assert_eq;
use std::time::Duration;

fn require_success() -> PipelineStep {
    PipelineStep::wait_with(BarrierPolicy::RequireSuccess)
}

#[tokio::test]
async fn test_every_batch_waits_for_the_previous_one() {
    let dispatcher = ScriptedDispatcher::new()
        .delay("slow", Duration::from_millis(150))
        .fail("flaky", 2);
    let harness = Harness::new(WorkerFixture::generic(4), dispatcher);
    let definition = PipelineFixture::batched(
        &[&["slow", "flaky"], &["build", "test"], &["deploy"]],
        PipelineStep::wait(),
    );

    let report = harness
        .run(&definition, ContextFixture::upstream())
        .await
        .expect("Run failed");

    let timeline = harness.timeline();
    timeline.assert_valid_transitions();
    timeline.assert_barrier(&["slow", "flaky"], &["build", "test", "deploy"]);
    timeline.assert_barrier(&["build", "test"], &["deploy"]);

    assert_eq!(report.verdict, Verdict::Failed);
    assert_eq!(report.count(StageState::Succeeded), 4);
}

#[tokio::test]
async fn test_require_success_cancels_later_batches() {
    let harness = Harness::new(
        WorkerFixture::generic(2),
        ScriptedDispatcher::new().fail("lint", 1),
    );
    let definition =
        PipelineFixture::batched(&[&["lint"], &["build", "test"]], require_success());

    let report = harness
        .run(&definition, ContextFixture::upstream())
        .await
        .expect("Run failed");

    assert_eq!(report.verdict, Verdict::Failed);
    assert_eq!(report.outcome("lint").unwrap().state, StageState::Failed);
    assert_eq!(report.count(StageState::Cancelled), 2);
    assert!(!harness.dispatcher.ran("build"));
    assert_eq!(
        harness.timeline().states_of("test"),
        vec![StageState::Pending, StageState::Cancelled]
    );
}

#[tokio::test]
async fn test_run_wide_policy_applies_to_plain_waits() {
    let config = SchedulerConfig {
        default_barrier: BarrierPolicy::RequireSuccess,
        ..Default::default()
    };
    let harness = Harness::with_config(
        WorkerFixture::generic(2),
        ScriptedDispatcher::new().fail("lint", 1),
        config,
    );
    let definition = PipelineFixture::batched(&[&["lint"], &["build"]], PipelineStep::wait());

    let report = harness
        .run(&definition, ContextFixture::upstream())
        .await
        .expect("Run failed");

    assert_eq!(report.outcome("build").unwrap().state, StageState::Cancelled);
    assert_eq!(report.verdict, Verdict::Failed);
}

#[tokio::test]
async fn test_await_completion_runs_past_failures() {
    let harness = Harness::new(
        WorkerFixture::generic(2),
        ScriptedDispatcher::new().fail("lint", 1),
    );
    let definition = PipelineFixture::batched(&[&["lint"], &["build"]], PipelineStep::wait());

    let report = harness
        .run(&definition, ContextFixture::upstream())
        .await
        .expect("Run failed");

    assert_eq!(report.outcome("build").unwrap().state, StageState::Succeeded);
    assert_eq!(report.verdict, Verdict::Failed);
}

#[tokio::test]
async fn test_failure_does_not_cancel_siblings() {
    let harness = Harness::new(
        WorkerFixture::generic(2),
        ScriptedDispatcher::new()
            .fail("a", 1)
            .delay("b", Duration::from_millis(100)),
    );

    let report = harness
        .run(&PipelineFixture::flat(&["a", "b"]), ContextFixture::upstream())
        .await
        .expect("Run failed");

    assert_eq!(report.outcome("a").unwrap().state, StageState::Failed);
    assert_eq!(report.outcome("b").unwrap().state, StageState::Succeeded);
}

#[tokio::test]
async fn test_require_success_sees_failures_from_any_earlier_batch() {
    let harness = Harness::new(
        WorkerFixture::generic(1),
        ScriptedDispatcher::new().fail("a", 1),
    );
    let definition = PipelineDefinition {
        steps: vec![
            PipelineStep::stage(StageDefinition::new("a").command("true")),
            PipelineStep::wait(),
            PipelineStep::stage(StageDefinition::new("b").command("true")),
            require_success(),
            PipelineStep::stage(StageDefinition::new("c").command("true")),
        ],
        ..Default::default()
    };

    let report = harness
        .run(&definition, ContextFixture::upstream())
        .await
        .expect("Run failed");

    assert_eq!(report.outcome("b").unwrap().state, StageState::Succeeded);
    assert_eq!(report.outcome("c").unwrap().state, StageState::Cancelled);
}

#[tokio::test]
async fn test_redundant_waits_collapse() {
    let harness = Harness::new(WorkerFixture::generic(1), ScriptedDispatcher::new());
    let definition = PipelineDefinition {
        steps: vec![
            PipelineStep::wait(),
            PipelineStep::stage(StageDefinition::new("a").command("true")),
            PipelineStep::wait(),
            require_success(),
            PipelineStep::stage(StageDefinition::new("b").command("true")),
            PipelineStep::Keyword("wait".to_string()),
        ],
        ..Default::default()
    };

    let handle = harness.prepare(&definition, ContextFixture::upstream());
    let batches = handle.graph().batches();
    assert_eq!(batches.len(), 2);
    assert_eq!(batches[0].gate, None);
    assert_eq!(batches[1].gate, Some(BarrierPolicy::RequireSuccess));

    let report = harness.orchestrator.execute(&handle).await.expect("Run failed");
    assert_eq!(report.verdict, Verdict::Succeeded);
}

#[tokio::test]
async fn test_max_parallel_caps_running_stages() {
    let config = SchedulerConfig {
        max_parallel: Some(1),
        ..Default::default()
    };
    let harness = Harness::with_config(
        WorkerFixture::generic(3),
        ScriptedDispatcher::new().with_delay(Duration::from_millis(30)),
        config,
    );

    let report = harness
        .run(&PipelineFixture::flat(&["a", "b", "c"]), ContextFixture::upstream())
        .await
        .expect("Run failed");

    assert_eq!(report.verdict, Verdict::Succeeded);
    assert_eq!(harness.dispatcher.high_water_mark(), 1);
}

#[tokio::test]
async fn test_zero_max_parallel_is_rejected() {
    let config = SchedulerConfig {
        max_parallel: Some(0),
        ..Default::default()
    };
    let harness = Harness::with_config(WorkerFixture::generic(1), ScriptedDispatcher::new(), config);

    let err = assert_completes_within(
        harness.run(&PipelineFixture::flat(&["only"]), ContextFixture::upstream()),
        Duration::from_secs(2),
    )
    .await
    .unwrap_err();

    assert!(err.is_configuration(), "unexpected error: {err}");
    assert!(harness.dispatcher.requests().is_empty());
}

#[tokio::test]
async fn test_concurrency_group_limits_members() {
    let harness = Harness::new(
        WorkerFixture::generic(3),
        ScriptedDispatcher::new().with_delay(Duration::from_millis(30)),
    );
    let deploy = |label: &str| {
        let mut stage = StageDefinition::new(label).command("./deploy.sh");
        stage.concurrency_group = Some("deploy".to_string());
        stage.concurrency = Some(1);
        PipelineStep::stage(stage)
    };
    let definition = PipelineDefinition {
        steps: vec![deploy("eu"), deploy("us"), deploy("ap")],
        ..Default::default()
    };

    let report = harness
        .run(&definition, ContextFixture::upstream())
        .await
        .expect("Run failed");

    assert_eq!(report.count(StageState::Succeeded), 3);
    assert_eq!(harness.dispatcher.high_water_mark(), 1);
}

#[tokio::test]
async fn test_priority_orders_ready_stages() {
    let harness = Harness::new(WorkerFixture::generic(1), ScriptedDispatcher::new());
    let mut urgent = StageDefinition::new("urgent").command("true");
    urgent.priority = 10;
    let definition = PipelineDefinition {
        steps: vec![
            PipelineStep::stage(StageDefinition::new("first").command("true")),
            PipelineStep::stage(StageDefinition::new("second").command("true")),
            PipelineStep::stage(urgent),
        ],
        ..Default::default()
    };

    harness
        .run(&definition, ContextFixture::upstream())
        .await
        .expect("Run failed");

    let started: Vec<String> = harness
        .dispatcher
        .started()
        .iter()
        .map(|s| s.to_string())
        .collect();
    assert_eq!(started, vec!["urgent", "first", "second"]);
}
