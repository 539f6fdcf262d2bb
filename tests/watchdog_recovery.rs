use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio::sync::oneshot;

use marathon::agent::SessionKind;
use marathon::errors::MarathonError;
use marathon::events::MarathonEvent;
use marathon::state::{ActionKind, StateStore};
use marathon::types::{CheckpointStatus, DisplayStatus, MarathonStatus, MilestoneStatus};
use marathon_test_utils::{
    PlanBuilder, TestEngine, eventually, fast_watchdog_settings, init_tracing, with_timeout,
};

fn five_step_plan() -> marathon::plan::MarathonPlan {
    PlanBuilder::new("five steps")
        .step("a", &[])
        .step("b", &["a"])
        .step("c", &["b"])
        .step("d", &["c"])
        .step("e", &["d"])
        .build()
}

#[tokio::test]
async fn crashed_marathon_resumes_where_it_stopped() {
    init_tracing();
    let mut engine = TestEngine::new();
    let mut state = engine.start(five_step_plan());
    for id in ["a", "b"] {
        state.plan.milestone_mut(id).unwrap().status = MilestoneStatus::Completed;
    }
    state.plan.milestone_mut("c").unwrap().status = MilestoneStatus::InProgress;
    state.begin_checkpoint("c", ActionKind::Execution.into(), "do c");
    state.heartbeat.last_heartbeat = Utc::now() - Duration::seconds(5);
    engine.store.save(&state).unwrap();

    let watchdog = engine.watchdog(fast_watchdog_settings(3));
    let before = watchdog.status(Some(&state.id)).await.unwrap();
    assert_eq!(before[0].display, DisplayStatus::Crashed);
    assert!(!before[0].live);

    let reports = watchdog.scan_once().await.unwrap();
    assert_eq!(reports.len(), 1);
    assert!(reports[0].live);
    assert_eq!(reports[0].restarts, 1);

    assert_eq!(
        with_timeout(watchdog.join(&state.id)).await,
        Some(MarathonStatus::Completed)
    );
    // Completed milestones are never re-run; the interrupted one is.
    assert_eq!(engine.agent.execution_order(), vec!["c", "d", "e"]);

    let saved = engine.load(&state.id);
    assert_eq!(saved.crash_count, 1);
    assert!(
        saved
            .plan
            .milestones
            .iter()
            .all(|m| m.status == MilestoneStatus::Completed)
    );
    let interrupted = &saved.checkpoints[0];
    assert_eq!(interrupted.status, CheckpointStatus::Failed);
    assert_eq!(interrupted.output.as_deref(), Some("interrupted"));

    let alerts = engine.notifier.messages_to("ops");
    assert!(alerts.iter().any(|m| m.contains("crashed")), "{alerts:?}");

    let events = engine.drain_events();
    assert!(events.iter().any(|e| matches!(e, MarathonEvent::CrashDetected { .. })));
    assert!(events.contains(&MarathonEvent::Resumed {
        restart: 1,
        max_restarts: 3
    }));
}

#[tokio::test]
async fn restart_budget_runs_out_after_max_restarts() {
    init_tracing();
    let engine = TestEngine::new();
    for _ in 0..3 {
        engine.agent.panic_on("a", SessionKind::Execute);
    }
    let plan = PlanBuilder::new("keeps dying").step("a", &[]).build();

    // The loop dies; status is left as it was and the heartbeat stops.
    let handle = engine.spawn(plan);
    let id = handle.id().to_string();
    assert_eq!(with_timeout(handle.wait()).await, MarathonStatus::Executing);

    let watchdog = Arc::new(engine.watchdog(fast_watchdog_settings(2)));
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let runner = tokio::spawn({
        let watchdog = watchdog.clone();
        async move {
            watchdog
                .run(async {
                    let _ = stop_rx.await;
                })
                .await
        }
    });

    eventually("marathon marked failed", || {
        let failed = engine.load(&id).status == MarathonStatus::Failed;
        async move { failed }
    })
    .await;
    let _ = stop_tx.send(());
    with_timeout(runner).await.unwrap();

    let state = engine.load(&id);
    assert_eq!(state.crash_count, 2);
    assert!(!state.restart_eligible);
    // First run plus two restarts, and no third restart.
    assert_eq!(engine.agent.calls("a", SessionKind::Execute), 3);
    eventually("max restarts alert", || {
        let sent = engine.notifier.any_contains("max restarts exceeded");
        async move { sent }
    })
    .await;

    let report = &watchdog.status(Some(&id)).await.unwrap()[0];
    assert_eq!(report.display, DisplayStatus::Failed);
    assert_eq!(report.restarts, 2);
}

#[tokio::test]
async fn manual_restart_retries_failed_milestones() {
    let engine = TestEngine::new();
    engine
        .agent
        .fail("a", SessionKind::Execute, "down")
        .fail("a", SessionKind::Recover, "down")
        .fail("a", SessionKind::Recover, "down");
    let plan = PlanBuilder::new("flaky upstream")
        .step("a", &[])
        .step("b", &["a"])
        .build();
    let handle = engine.spawn(plan);
    let id = handle.id().to_string();
    assert_eq!(with_timeout(handle.wait()).await, MarathonStatus::Failed);

    let watchdog = engine.watchdog(fast_watchdog_settings(3));
    watchdog.restart(&id).await.unwrap();
    assert!(matches!(
        watchdog.restart(&id).await,
        Err(MarathonError::InvalidState { .. })
    ));
    assert_eq!(
        with_timeout(watchdog.join(&id)).await,
        Some(MarathonStatus::Completed)
    );

    let state = engine.load(&id);
    for id in ["a", "b"] {
        assert_eq!(state.plan.milestone(id).unwrap().status, MilestoneStatus::Completed);
    }
    assert!(state.restart_eligible);
}

#[tokio::test]
async fn restart_is_refused_while_another_owner_is_alive() {
    init_tracing();
    let engine = TestEngine::new();
    engine.agent.hang("a", SessionKind::Execute);
    // Nothing in the watchdog below tracks this executor, as if it ran in
    // another process.
    let owner = engine.spawn(PlanBuilder::new("long call").step("a", &[]).step("b", &["a"]).build());
    let id = owner.id().to_string();
    eventually("agent called", || {
        let called = engine.agent.calls("a", SessionKind::Execute) == 1;
        async move { called }
    })
    .await;

    // Heartbeats keep coming while the agent call is outstanding.
    tokio::time::sleep(std::time::Duration::from_millis(400)).await;
    let watchdog = engine.watchdog(fast_watchdog_settings(3));
    let report = &watchdog.status(Some(&id)).await.unwrap()[0];
    assert_eq!(report.display, DisplayStatus::Executing);
    assert!(!report.live);
    assert!(watchdog.scan_once().await.unwrap().iter().all(|r| !r.live));

    assert!(matches!(
        watchdog.restart(&id).await,
        Err(MarathonError::InvalidState { .. })
    ));
    let saved = engine.load(&id);
    assert_eq!(
        saved.plan.milestone("a").unwrap().status,
        MilestoneStatus::InProgress
    );
    assert_eq!(engine.agent.calls("a", SessionKind::Execute), 1);

    // Same for a marathon parked on a human decision.
    let mut waiting = engine.start(PlanBuilder::new("parked").step("a", &[]).build());
    waiting.status = MarathonStatus::WaitingHuman;
    engine.store.save(&waiting).unwrap();
    assert!(matches!(
        watchdog.restart(&waiting.id).await,
        Err(MarathonError::InvalidState { .. })
    ));
    assert_eq!(engine.load(&waiting.id).status, MarathonStatus::WaitingHuman);
}

#[tokio::test]
async fn pause_stops_before_the_next_milestone() {
    let engine = TestEngine::new();
    let watchdog = engine.watchdog(fast_watchdog_settings(3));
    let handle = engine.spawn(PlanBuilder::new("two").step("a", &[]).step("b", &["a"]).build());
    let id = handle.id().to_string();
    watchdog.track(handle).await;

    watchdog.pause(&id).await.unwrap();
    assert_eq!(
        with_timeout(watchdog.join(&id)).await,
        Some(MarathonStatus::Paused)
    );
    assert!(engine.agent.execution_order().is_empty());

    let state = engine.load(&id);
    assert!(state.control.is_none());
    assert!(state.last_control_at.is_some());
    assert!(state.restart_eligible);
    let report = &watchdog.status(Some(&id)).await.unwrap()[0];
    assert_eq!(report.display, DisplayStatus::Paused);

    // A paused marathon is never treated as crashed.
    assert!(watchdog.scan_once().await.unwrap().iter().all(|r| !r.live));

    watchdog.restart(&id).await.unwrap();
    assert_eq!(
        with_timeout(watchdog.join(&id)).await,
        Some(MarathonStatus::Completed)
    );
    assert_eq!(engine.agent.execution_order(), vec!["a", "b"]);
}
