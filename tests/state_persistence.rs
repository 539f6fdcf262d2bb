use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use marathon::approval::{ApprovalPolicy, ApprovalRequest, ApprovalSubject};
use marathon::engine::{EngineContext, Executor, start_marathon};
use marathon::events::bounded;
use marathon::fs::mock::MockFileSystem;
use marathon::state::{
    ActionKind, CheckpointPayload, ControlAction, ControlRequest, FileStateStore, LogLevel,
    SharedState, StateStore,
};
use marathon::types::{BackpressurePolicy, CheckpointStatus, MarathonStatus, RiskTier};
use marathon_test_utils::{
    PlanBuilder, ScriptedAgent, TestEngine, fast_engine_settings, init_tracing, with_timeout,
};

#[test]
fn full_state_survives_a_round_trip_on_disk() {
    let engine = TestEngine::new();
    let plan = PlanBuilder::new("round trip")
        .step("a", &[])
        .step("b", &["a"])
        .thinking("execute", "be terse")
        .build();
    let mut state = engine.start(plan);

    let first = state.begin_checkpoint("a", ActionKind::Execution.into(), "prompt a");
    state.finish_checkpoint(first, "reply a", CheckpointStatus::Completed);
    state.begin_checkpoint(
        "b",
        CheckpointPayload::Opaque(json!({"kind": "tool_batch", "tools": ["grep", "sed"]})),
        "prompt b",
    );
    state.approvals.push(ApprovalRequest::new(
        "r1",
        state.id.clone(),
        ApprovalSubject::milestone("b"),
        "send email to customers",
        RiskTier::Medium,
        vec!["outbound message".into()],
        Some(Utc::now()),
        true,
    ));
    state.control = Some(ControlRequest {
        action: ControlAction::Pause,
        issued_at: Utc::now(),
        issued_by: Some("ops".into()),
    });
    state.context_summary = "- a: reply a".into();
    state.continuity_token = Some("tok".into());
    state.log(LogLevel::Warn, "something odd", 200);

    engine.store.save(&state).unwrap();
    let loaded = engine.load(&state.id);
    assert_eq!(loaded, state);
    assert!(matches!(
        loaded.checkpoints[1].payload,
        CheckpointPayload::Opaque(_)
    ));
    assert_eq!(engine.store.list_ids().unwrap(), vec![state.id.clone()]);
}

#[test]
fn unknown_checkpoint_shapes_are_kept_verbatim() {
    let engine = TestEngine::new();
    let state = engine.start(PlanBuilder::new("compat").step("a", &[]).build());
    let path = engine.store.path_for(&state.id);

    let mut doc: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    doc["checkpoints"] = json!([{
        "id": "cp-1",
        "action_index": 1,
        "milestone_id": "a",
        "payload": {"kind": "from_the_future", "detail": 42},
        "input": "x",
        "status": "completed",
        "started_at": Utc::now(),
    }]);
    std::fs::write(&path, serde_json::to_string_pretty(&doc).unwrap()).unwrap();

    let loaded = engine.load(&state.id);
    assert_eq!(
        loaded.checkpoints[0].payload,
        CheckpointPayload::Opaque(json!({"kind": "from_the_future", "detail": 42}))
    );
    engine.store.save(&loaded).unwrap();
    let raw = std::fs::read_to_string(&path).unwrap();
    assert!(raw.contains("from_the_future"));
}

#[tokio::test]
async fn persistence_failures_do_not_stop_the_marathon() {
    init_tracing();
    let fs = MockFileSystem::new();
    let store = Arc::new(FileStateStore::new("/state", Arc::new(fs.clone())));
    let (events, _rx) = bounded(64, BackpressurePolicy::DropOldest, Duration::ZERO);
    let ctx = EngineContext::new(
        Arc::new(ScriptedAgent::new()),
        store.clone(),
        events,
        fast_engine_settings(),
        ApprovalPolicy::permissive(),
    );
    let state = start_marathon(
        &ctx,
        PlanBuilder::new("offline disk").step("a", &[]).step("b", &[]).build(),
        "/work",
    )
    .unwrap();
    let id = state.id.clone();

    fs.set_fail_writes(true);
    let handle = Executor::new(state, ctx.clone()).spawn();
    let shared = handle.shared().clone();
    assert_eq!(with_timeout(handle.wait()).await, MarathonStatus::Completed);

    // Memory is authoritative; disk is stale but intact.
    let live = shared.snapshot().await;
    assert_eq!(live.status, MarathonStatus::Completed);
    assert!(
        live.logs
            .iter()
            .any(|l| l.level == LogLevel::Warn && l.message.contains("persist failed"))
    );
    assert_eq!(
        store.load_existing(&id).unwrap().status,
        MarathonStatus::Executing
    );

    // The next successful write catches the disk up.
    fs.set_fail_writes(false);
    assert!(shared.persist().await);
    assert_eq!(
        store.load_existing(&id).unwrap().status,
        MarathonStatus::Completed
    );
}

#[tokio::test]
async fn decisions_written_to_disk_are_merged_on_next_save() {
    let engine = TestEngine::new();
    let mut state = engine.start(PlanBuilder::new("merge").step("a", &[]).build());
    state.approvals.push(ApprovalRequest::new(
        "r1",
        state.id.clone(),
        ApprovalSubject::milestone("a"),
        "rm -rf tmp",
        RiskTier::High,
        Vec::new(),
        None,
        false,
    ));
    engine.store.save(&state).unwrap();
    let shared = SharedState::new(state.clone(), engine.store.clone(), 200);

    // Another writer resolves the request and asks for a pause.
    let mut other = engine.load(&state.id);
    other
        .approval_mut("r1")
        .unwrap()
        .approve("alice", Utc::now())
        .unwrap();
    other.control = Some(ControlRequest {
        action: ControlAction::Abort,
        issued_at: Utc::now(),
        issued_by: None,
    });
    engine.store.save(&other).unwrap();

    // A heartbeat-style write from the owner must not undo either.
    shared.update(|s| s.heartbeat.last_action = Some("working".into())).await;

    let merged = engine.load(&state.id);
    assert_eq!(merged.heartbeat.last_action.as_deref(), Some("working"));
    assert!(merged.approval("r1").unwrap().status.is_terminal());
    assert_eq!(
        merged.control.as_ref().map(|c| c.action),
        Some(ControlAction::Abort)
    );
}
