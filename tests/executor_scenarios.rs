use marathon::agent::SessionKind;
use marathon::events::MarathonEvent;
use marathon::types::{CheckpointStatus, MarathonStatus, MilestoneStatus};
use marathon_test_utils::{MilestoneBuilder, PlanBuilder, TestEngine, init_tracing, with_timeout};

#[tokio::test]
async fn independent_milestones_all_complete() {
    init_tracing();
    let mut engine = TestEngine::new();
    let plan = PlanBuilder::new("ship it")
        .step("a", &[])
        .step("b", &[])
        .step("c", &[])
        .build();

    let handle = engine.spawn(plan);
    let id = handle.id().to_string();
    let status = with_timeout(handle.wait()).await;

    assert_eq!(status, MarathonStatus::Completed);
    let state = engine.load(&id);
    assert_eq!(state.status, MarathonStatus::Completed);
    assert!(
        state
            .plan
            .milestones
            .iter()
            .all(|m| m.status == MilestoneStatus::Completed && m.actual_duration_ms.is_some())
    );
    assert_eq!(engine.agent.execution_order(), vec!["a", "b", "c"]);

    let events = engine.drain_events();
    assert!(matches!(events.first(), Some(MarathonEvent::Started { milestones: 3, .. })));
    let completed = events
        .iter()
        .filter(|e| matches!(e, MarathonEvent::MilestoneCompleted { .. }))
        .count();
    assert_eq!(completed, 3);
    assert!(matches!(
        events.last(),
        Some(MarathonEvent::Finished {
            status: MarathonStatus::Completed,
            ..
        })
    ));
}

#[tokio::test]
async fn dependencies_run_before_dependents() {
    let engine = TestEngine::new();
    let plan = PlanBuilder::new("layered")
        .step("deploy", &["build", "test"])
        .step("test", &["build"])
        .step("build", &[])
        .build();

    let status = with_timeout(engine.spawn(plan).wait()).await;

    assert_eq!(status, MarathonStatus::Completed);
    assert_eq!(engine.agent.execution_order(), vec!["build", "test", "deploy"]);
}

#[tokio::test]
async fn recovery_pass_succeeds_on_last_retry() {
    let engine = TestEngine::new();
    engine
        .agent
        .reply("a", SessionKind::Verify, "FAIL: unit tests red")
        .reply("a", SessionKind::Verify, r#"{"passed": false, "reason": "lint errors"}"#)
        .reply("a", SessionKind::Verify, "PASS");
    let plan = PlanBuilder::new("fix build")
        .milestone(MilestoneBuilder::new("a").verify("cargo test passes").max_retries(2))
        .build();

    let handle = engine.spawn(plan);
    let id = handle.id().to_string();
    assert_eq!(with_timeout(handle.wait()).await, MarathonStatus::Completed);

    let state = engine.load(&id);
    let a = state.plan.milestone("a").unwrap();
    assert_eq!(a.status, MilestoneStatus::Completed);
    assert_eq!(a.retry_count, 2);
    assert_eq!(engine.agent.calls("a", SessionKind::Execute), 1);
    assert_eq!(engine.agent.calls("a", SessionKind::Recover), 2);

    let recover = engine
        .agent
        .requests()
        .into_iter()
        .find(|r| r.session == SessionKind::Recover)
        .unwrap();
    assert!(recover.prompt.contains("unit tests red"));
}

#[tokio::test]
async fn exhausted_retries_fail_the_marathon() {
    let engine = TestEngine::new();
    engine
        .agent
        .fail("a", SessionKind::Execute, "tool crashed")
        .fail("a", SessionKind::Recover, "tool crashed again")
        .fail("a", SessionKind::Recover, "still broken");
    let plan = PlanBuilder::new("doomed")
        .step("a", &[])
        .step("b", &["a"])
        .step("c", &[])
        .build();

    let handle = engine.spawn(plan);
    let id = handle.id().to_string();
    assert_eq!(with_timeout(handle.wait()).await, MarathonStatus::Failed);

    let state = engine.load(&id);
    let a = state.plan.milestone("a").unwrap();
    assert_eq!(a.status, MilestoneStatus::Failed);
    assert_eq!(a.retry_count, 2);
    assert_eq!(a.last_error.as_deref(), Some("Agent call failed: still broken"));
    assert_eq!(state.plan.milestone("b").unwrap().status, MilestoneStatus::Skipped);
    // Independent work still ran.
    assert_eq!(state.plan.milestone("c").unwrap().status, MilestoneStatus::Completed);
    assert!(engine.notifier.sent().is_empty(), "no notify channel configured");
}

#[tokio::test]
async fn repeated_output_forces_a_corrective_prompt() {
    init_tracing();
    let mut engine = TestEngine::new();
    let same = "Checked the config, nothing to change. Iteration 1.";
    engine
        .agent
        .reply("a", SessionKind::Execute, same)
        .reply_n("a", SessionKind::Recover, same, 2)
        .reply("a", SessionKind::Verify, "FAIL: not done")
        .reply("a", SessionKind::Verify, "FAIL: still not done");
    let plan = PlanBuilder::new("stuck agent")
        .milestone(MilestoneBuilder::new("a").verify("config updated").max_retries(3))
        .build();

    let handle = engine.spawn(plan);
    let id = handle.id().to_string();
    assert_eq!(with_timeout(handle.wait()).await, MarathonStatus::Completed);

    // Third identical reply triggers exactly one corrective prompt, then a
    // fresh recovery pass (not a fourth identical one).
    assert_eq!(engine.agent.calls("a", SessionKind::Corrective), 1);
    assert_eq!(engine.agent.calls("a", SessionKind::Recover), 3);
    let state = engine.load(&id);
    assert_eq!(state.plan.milestone("a").unwrap().retry_count, 3);

    let loops: Vec<_> = engine
        .drain_events()
        .into_iter()
        .filter(|e| matches!(e, MarathonEvent::LoopDetected { .. }))
        .collect();
    assert_eq!(
        loops,
        vec![MarathonEvent::LoopDetected {
            milestone_id: "a".into(),
            occurrences: 3
        }]
    );
}

#[tokio::test]
async fn artifacts_are_checked_when_no_verification_steps() {
    let engine = TestEngine::new();
    std::fs::write(engine.workdir().join("present.txt"), "ok").unwrap();
    let plan = PlanBuilder::new("files")
        .milestone(MilestoneBuilder::new("ok").artifact("present.txt"))
        .milestone(MilestoneBuilder::new("missing").artifact("absent.txt").max_retries(0))
        .build();

    let handle = engine.spawn(plan);
    let id = handle.id().to_string();
    assert_eq!(with_timeout(handle.wait()).await, MarathonStatus::Failed);

    let state = engine.load(&id);
    assert_eq!(state.plan.milestone("ok").unwrap().status, MilestoneStatus::Completed);
    let missing = state.plan.milestone("missing").unwrap();
    assert_eq!(missing.status, MilestoneStatus::Failed);
    assert!(missing.last_error.as_deref().unwrap().contains("absent.txt"));
    assert_eq!(engine.agent.calls("ok", SessionKind::Verify), 0);
}

#[tokio::test]
async fn checkpoints_are_recorded_in_order() {
    let engine = TestEngine::new();
    engine.agent.fail("b", SessionKind::Execute, "flaky");
    let plan = PlanBuilder::new("audit")
        .step("a", &[])
        .milestone(MilestoneBuilder::new("b").verify("looks right"))
        .build();

    let handle = engine.spawn(plan);
    let id = handle.id().to_string();
    assert_eq!(with_timeout(handle.wait()).await, MarathonStatus::Completed);

    let state = engine.load(&id);
    let indexes: Vec<u64> = state.checkpoints.iter().map(|c| c.action_index).collect();
    assert!(indexes.windows(2).all(|w| w[0] < w[1]), "{indexes:?}");
    // a: execute; b: execute (failed), recover, verify.
    assert_eq!(state.checkpoints.len(), 4);
    assert_eq!(state.checkpoints[1].milestone_id, "b");
    assert_eq!(state.checkpoints[1].status, CheckpointStatus::Failed);
    assert!(
        state
            .checkpoints
            .iter()
            .all(|c| c.status != CheckpointStatus::Pending && c.finished_at.is_some())
    );
}

#[tokio::test]
async fn continuity_token_is_carried_to_the_next_call() {
    let engine = TestEngine::new();
    engine
        .agent
        .reply_with_token("a", SessionKind::Execute, "did the thing", "tok-1");
    let plan = PlanBuilder::new("chain").step("a", &[]).step("b", &["a"]).build();
    let handle = engine.spawn(plan);
    let id = handle.id().to_string();
    assert_eq!(with_timeout(handle.wait()).await, MarathonStatus::Completed);

    let requests = engine.agent.requests();
    assert!(requests.iter().all(|r| r.peer_id == id));
    let first_a = requests
        .iter()
        .find(|r| r.milestone_id == "a" && r.session == SessionKind::Execute)
        .unwrap();
    assert_eq!(first_a.continuity_token, None);
    let first_b = requests
        .iter()
        .find(|r| r.milestone_id == "b" && r.session == SessionKind::Execute)
        .unwrap();
    assert_eq!(first_b.continuity_token.as_deref(), Some("tok-1"));

    let state = engine.load(&id);
    assert_eq!(state.continuity_token.as_deref(), Some("tok-1"));
    assert!(state.context_summary.contains("did the thing"));
}
