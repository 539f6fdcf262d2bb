// src/watchdog/mod.rs

//! Crash detection, automatic resume and operator controls.
//!
//! A [`Watchdog`] is an explicitly constructed service: it scans the state
//! store on a fixed interval, classifies every marathon from its persisted
//! heartbeat, and resumes crashed ones with a fresh [`Executor`] until the
//! per-marathon restart budget runs out. Executors it starts (or is handed
//! via [`Watchdog::track`]) are live; operator commands are routed to them
//! so the write lands in the executor's own state. Everything else goes
//! through the store.

pub mod classify;

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::approval::{ApprovalRequest, approve_request, reject_request};
use crate::config::WatchdogSettings;
use crate::engine::{EngineContext, Executor, ExecutorHandle, core};
use crate::errors::{MarathonError, Result};
use crate::events::MarathonEvent;
use crate::notify::spawn_alerts;
use crate::state::{ControlAction, ControlRequest, DurableMarathonState, LogLevel};
use crate::types::{DisplayStatus, MarathonStatus};

pub use classify::derive_display_status;

const OPERATOR: &str = "operator";
const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Session-scoped bookkeeping for one marathon.
#[derive(Debug, Default)]
struct Tracked {
    /// Crashes counted since this watchdog started tracking it.
    restarts: u32,
    live: Option<ExecutorHandle>,
    /// Heartbeat stamp of the last crash acted on, so one stale stamp
    /// triggers one alert.
    handled_heartbeat: Option<DateTime<Utc>>,
}

impl Tracked {
    fn running(&self) -> Option<&ExecutorHandle> {
        self.live.as_ref().filter(|h| !h.is_finished())
    }
}

/// One line of `status` output.
#[derive(Debug, Clone, Serialize)]
pub struct MarathonReport {
    pub id: String,
    pub goal: String,
    pub display: DisplayStatus,
    pub status: MarathonStatus,
    pub progress: String,
    pub last_heartbeat: DateTime<Utc>,
    pub heartbeat_age_ms: u64,
    pub last_action: Option<String>,
    pub restarts: u32,
    pub crash_count: u32,
    pub pending_approvals: usize,
    /// Driven by an executor in this process.
    pub live: bool,
}

impl MarathonReport {
    fn new(state: &DurableMarathonState, now: DateTime<Utc>, restarts: u32, live: bool) -> Self {
        Self {
            id: state.id.clone(),
            goal: state.plan.goal.clone(),
            display: derive_display_status(state, now),
            status: state.status,
            progress: state.plan.progress_summary(),
            last_heartbeat: state.heartbeat.last_heartbeat,
            heartbeat_age_ms: state.heartbeat.age_ms(now),
            last_action: state.heartbeat.last_action.clone(),
            restarts,
            crash_count: state.crash_count,
            pending_approvals: state.pending_approvals().count(),
            live,
        }
    }
}

/// A pending approval request together with the marathon that raised it.
#[derive(Debug, Clone, Serialize)]
pub struct PendingApproval {
    pub marathon_id: String,
    pub goal: String,
    pub request: ApprovalRequest,
    /// Past its deadline without auto-approval; still blocking.
    pub overdue: bool,
}

pub struct Watchdog {
    ctx: EngineContext,
    settings: WatchdogSettings,
    tracked: Mutex<HashMap<String, Tracked>>,
}

impl Watchdog {
    pub fn new(ctx: EngineContext, settings: WatchdogSettings) -> Self {
        Self {
            ctx,
            settings,
            tracked: Mutex::new(HashMap::new()),
        }
    }

    /// Collaborators handed to every executor this watchdog starts.
    pub fn context(&self) -> &EngineContext {
        &self.ctx
    }

    pub fn settings(&self) -> &WatchdogSettings {
        &self.settings
    }

    /// Scan until `shutdown` resolves. Live executors keep running after
    /// this returns; they stop with the runtime.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) {
        let mut ticker = tokio::time::interval(self.settings.scan_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        info!(
            interval = ?self.settings.scan_interval,
            max_restarts = self.settings.max_restarts,
            auto_resume = self.settings.auto_resume,
            "watchdog started"
        );
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.scan_once().await {
                        warn!(error = %e, "watchdog scan failed");
                    }
                }
                _ = &mut shutdown => {
                    info!("watchdog stopping");
                    break;
                }
            }
        }
    }

    /// One pass over the store: start tracking new marathons, reap finished
    /// executors, act on crashes. Returns a report per tracked marathon.
    pub async fn scan_once(&self) -> Result<Vec<MarathonReport>> {
        let ids = self.ctx.store.list_ids()?;
        let mut tracked = self.tracked.lock().await;
        for id in &ids {
            if !tracked.contains_key(id) {
                debug!(marathon = %id, "tracking marathon");
                tracked.insert(id.clone(), Tracked::default());
            }
        }

        let mut order: Vec<String> = tracked.keys().cloned().collect();
        order.sort();

        let mut reports = Vec::with_capacity(order.len());
        for id in order {
            let Some(entry) = tracked.get_mut(&id) else {
                continue;
            };

            if entry.live.as_ref().is_some_and(|h| h.is_finished()) {
                if let Some(handle) = entry.live.take() {
                    let status = handle.wait().await;
                    debug!(marathon = %id, %status, "executor finished");
                }
            }

            let now = Utc::now();
            if let Some(handle) = &entry.live {
                let state = handle.shared().snapshot().await;
                reports.push(MarathonReport::new(&state, now, entry.restarts, true));
                continue;
            }

            let state = match self.ctx.store.load(&id) {
                Ok(Some(state)) => state,
                Ok(None) => {
                    debug!(marathon = %id, "state file gone; untracking");
                    tracked.remove(&id);
                    continue;
                }
                Err(e) => {
                    warn!(marathon = %id, error = %e, "could not load marathon state");
                    continue;
                }
            };

            if derive_display_status(&state, now) == DisplayStatus::Crashed {
                let state = self.handle_crash(entry, state, now).await;
                let live = entry.live.is_some();
                reports.push(MarathonReport::new(&state, Utc::now(), entry.restarts, live));
            } else {
                reports.push(MarathonReport::new(&state, now, entry.restarts, false));
            }
        }
        Ok(reports)
    }

    /// Alert, then resume or give up. Returns the state as it now stands.
    async fn handle_crash(
        &self,
        entry: &mut Tracked,
        mut state: DurableMarathonState,
        now: DateTime<Utc>,
    ) -> DurableMarathonState {
        let stamp = state.heartbeat.last_heartbeat;
        if entry.handled_heartbeat == Some(stamp) {
            return state;
        }
        entry.handled_heartbeat = Some(stamp);

        let id = state.id.clone();
        let age_ms = state.heartbeat.age_ms(now);
        let max = self.settings.max_restarts;
        warn!(marathon = %id, heartbeat_age_ms = age_ms, restarts = entry.restarts, "crash detected");
        self.emit(
            &id,
            MarathonEvent::CrashDetected {
                display: DisplayStatus::Crashed,
                heartbeat_age_ms: age_ms,
                restarts: entry.restarts,
            },
        )
        .await;

        if !state.restart_eligible {
            self.alert(format!(
                "Marathon {id} crashed (heartbeat {}s old); not eligible for automatic restart",
                age_ms / 1000
            ));
            return state;
        }

        if entry.restarts >= max {
            state.status = MarathonStatus::Failed;
            state.restart_eligible = false;
            state.log(
                LogLevel::Error,
                format!("max restarts exceeded ({max}); marked failed"),
                self.ctx.settings.max_log_entries,
            );
            if let Err(e) = self.ctx.store.save(&state) {
                error!(marathon = %id, error = %e, "could not persist failed marathon");
            }
            error!(marathon = %id, restarts = entry.restarts, "max restarts exceeded");
            self.alert(format!(
                "Marathon {id} failed: max restarts exceeded ({max})"
            ));
            self.emit(
                &id,
                MarathonEvent::MaxRestartsExceeded {
                    restarts: entry.restarts,
                },
            )
            .await;
            return state;
        }

        entry.restarts += 1;
        state.crash_count += 1;
        self.alert(format!(
            "Marathon {id} crashed (heartbeat {}s old, restart {}/{max})",
            age_ms / 1000,
            entry.restarts
        ));
        if !self.settings.auto_resume {
            state.log(
                LogLevel::Warn,
                format!("crash detected; auto-resume disabled ({}/{max})", entry.restarts),
                self.ctx.settings.max_log_entries,
            );
            if let Err(e) = self.ctx.store.save(&state) {
                error!(marathon = %id, error = %e, "could not persist crash count");
            }
            return state;
        }

        state.prepare_for_resume();
        state.log(
            LogLevel::Warn,
            format!("resumed after crash (restart {}/{max})", entry.restarts),
            self.ctx.settings.max_log_entries,
        );
        info!(marathon = %id, restart = entry.restarts, max_restarts = max, "resuming crashed marathon");

        entry.live = Some(Executor::new(state.clone(), self.ctx.clone()).spawn());
        self.emit(
            &id,
            MarathonEvent::Resumed {
                restart: entry.restarts,
                max_restarts: max,
            },
        )
        .await;
        state
    }

    /// Take over bookkeeping for an executor started elsewhere.
    pub async fn track(&self, handle: ExecutorHandle) {
        let id = handle.id().to_string();
        let mut tracked = self.tracked.lock().await;
        let entry = tracked.entry(id.clone()).or_default();
        if let Some(previous) = entry.live.replace(handle) {
            if !previous.is_finished() {
                warn!(marathon = %id, "replacing a running executor handle");
            }
        }
        debug!(marathon = %id, "tracking live executor");
    }

    /// Wait for the live executor of `id` to stop. `None` if there is none.
    ///
    /// The handle stays tracked while the executor runs, so operator
    /// commands issued meanwhile still reach it.
    pub async fn join(&self, id: &str) -> Option<MarathonStatus> {
        loop {
            let finished = {
                let mut tracked = self.tracked.lock().await;
                let entry = tracked.get_mut(id)?;
                if entry.live.as_ref()?.is_finished() {
                    entry.live.take()
                } else {
                    None
                }
            };
            if let Some(handle) = finished {
                return Some(handle.wait().await);
            }
            tokio::time::sleep(JOIN_POLL_INTERVAL).await;
        }
    }

    /// Reports for one marathon, or for every stored and live one.
    pub async fn status(&self, id: Option<&str>) -> Result<Vec<MarathonReport>> {
        let tracked = self.tracked.lock().await;
        let ids = match id {
            Some(id) => vec![id.to_string()],
            None => {
                let mut ids = self.ctx.store.list_ids()?;
                for (id, entry) in tracked.iter() {
                    if entry.live.is_some() && !ids.contains(id) {
                        ids.push(id.clone());
                    }
                }
                ids.sort();
                ids
            }
        };

        let now = Utc::now();
        let mut reports = Vec::with_capacity(ids.len());
        for id in ids {
            let entry = tracked.get(&id);
            let restarts = entry.map_or(0, |t| t.restarts);
            match entry.and_then(|t| t.live.as_ref()) {
                Some(handle) => {
                    let state = handle.shared().snapshot().await;
                    reports.push(MarathonReport::new(&state, now, restarts, true));
                }
                None => {
                    let state = self.ctx.store.load_existing(&id)?;
                    reports.push(MarathonReport::new(&state, now, restarts, false));
                }
            }
        }
        Ok(reports)
    }

    /// Every pending approval request across all marathons.
    pub async fn pending_approvals(&self) -> Result<Vec<PendingApproval>> {
        let now = Utc::now();
        let mut pending = Vec::new();
        for report in self.status(None).await? {
            let state = self.current_state(&report.id).await?;
            for request in state.pending_approvals() {
                pending.push(PendingApproval {
                    marathon_id: state.id.clone(),
                    goal: state.plan.goal.clone(),
                    overdue: request.is_past_expiry(now) && !request.auto_approve_on_expiry,
                    request: request.clone(),
                });
            }
        }
        pending.sort_by_key(|p| p.request.created_at);
        Ok(pending)
    }

    pub async fn approve(
        &self,
        marathon_id: &str,
        request_id: &str,
        approver: Option<&str>,
    ) -> Result<ApprovalRequest> {
        let approver = approver.unwrap_or(OPERATOR);
        let now = Utc::now();
        let max_logs = self.ctx.settings.max_log_entries;

        if let Some(shared) = self.live_state(marathon_id).await {
            let request = shared
                .update(|s| approve_request(s, request_id, approver, now))
                .await?;
            info!(marathon = %marathon_id, request = %request_id, %approver, "approval granted");
            return Ok(request);
        }

        let mut state = self.ctx.store.load_existing(marathon_id)?;
        let request = approve_request(&mut state, request_id, approver, now)?;
        state.log(
            LogLevel::Info,
            format!("approval {request_id} granted by {approver}"),
            max_logs,
        );
        // With no executor waiting in this process, put the marathon back to
        // executing so a dead waiter reads as a crash and gets resumed.
        if state.status == MarathonStatus::WaitingHuman && state.pending_approvals().next().is_none()
        {
            state.set_status(MarathonStatus::Executing);
        }
        self.ctx.store.save(&state)?;
        info!(marathon = %marathon_id, request = %request_id, %approver, "approval granted");
        self.emit(
            marathon_id,
            MarathonEvent::ApprovalResolved {
                request_id: request_id.to_string(),
                approved: true,
                by: Some(approver.to_string()),
            },
        )
        .await;
        Ok(request)
    }

    pub async fn reject(
        &self,
        marathon_id: &str,
        request_id: &str,
        approver: Option<&str>,
        reason: &str,
    ) -> Result<ApprovalRequest> {
        let approver = approver.unwrap_or(OPERATOR);
        let now = Utc::now();
        let max_logs = self.ctx.settings.max_log_entries;

        if let Some(shared) = self.live_state(marathon_id).await {
            let request = shared
                .update(|s| reject_request(s, request_id, approver, reason, now))
                .await?;
            info!(marathon = %marathon_id, request = %request_id, %approver, "approval rejected");
            return Ok(request);
        }

        let mut state = self.ctx.store.load_existing(marathon_id)?;
        let request = reject_request(&mut state, request_id, approver, reason, now)?;
        if state.status == MarathonStatus::WaitingHuman {
            state.status = MarathonStatus::Paused;
        }
        state.log(
            LogLevel::Warn,
            format!("approval {request_id} rejected by {approver} ({reason})"),
            max_logs,
        );
        self.ctx.store.save(&state)?;
        info!(marathon = %marathon_id, request = %request_id, %approver, "approval rejected");
        self.emit(
            marathon_id,
            MarathonEvent::ApprovalResolved {
                request_id: request_id.to_string(),
                approved: false,
                by: Some(approver.to_string()),
            },
        )
        .await;
        Ok(request)
    }

    pub async fn pause(&self, id: &str) -> Result<()> {
        self.control(id, ControlAction::Pause).await
    }

    /// Stop for good: the marathon fails and is never auto-restarted.
    pub async fn abort(&self, id: &str) -> Result<()> {
        self.control(id, ControlAction::Abort).await
    }

    async fn control(&self, id: &str, action: ControlAction) -> Result<()> {
        let request = ControlRequest {
            action,
            issued_at: Utc::now(),
            issued_by: Some(OPERATOR.to_string()),
        };

        if let Some(shared) = self.live_state(id).await {
            let status = shared.read(|s| s.status).await;
            if status.is_terminal() {
                return Err(MarathonError::InvalidState {
                    id: id.to_string(),
                    status: status.to_string(),
                });
            }
            shared.update(|s| s.control = Some(request)).await;
            info!(marathon = %id, ?action, "control request sent to executor");
            return Ok(());
        }

        let mut state = self.ctx.store.load_existing(id)?;
        if state.status.is_terminal() {
            return Err(MarathonError::InvalidState {
                id: id.to_string(),
                status: state.status.to_string(),
            });
        }
        let status = core::apply_control(&mut state, &request, self.ctx.settings.max_log_entries);
        // Left in place for an executor in another process to pick up.
        state.control = Some(request);
        self.ctx.store.save(&state)?;
        info!(marathon = %id, ?action, %status, "control request applied");
        self.emit(id, MarathonEvent::StatusChanged { status }).await;
        Ok(())
    }

    /// Operator restart: failed and skipped milestones get a fresh budget,
    /// the restart counter is reset, and a new executor is started.
    pub async fn restart(&self, id: &str) -> Result<()> {
        let mut tracked = self.tracked.lock().await;
        if tracked.get(id).and_then(Tracked::running).is_some() {
            return Err(MarathonError::InvalidState {
                id: id.to_string(),
                status: "already running".to_string(),
            });
        }

        let mut state = self.ctx.store.load_existing(id)?;
        // A fresh heartbeat or a pending decision means another process owns it.
        let display = derive_display_status(&state, Utc::now());
        if matches!(display, DisplayStatus::Executing | DisplayStatus::WaitingHuman) {
            return Err(MarathonError::InvalidState {
                id: id.to_string(),
                status: display.to_string(),
            });
        }
        let entry = tracked.entry(id.to_string()).or_default();
        let previous = state.status;
        state.reset_for_manual_restart();
        state.log(
            LogLevel::Info,
            format!("restarted by {OPERATOR} (was {previous})"),
            self.ctx.settings.max_log_entries,
        );
        self.ctx.store.save(&state)?;

        entry.restarts = 0;
        entry.handled_heartbeat = None;
        entry.live = Some(Executor::new(state, self.ctx.clone()).spawn());
        info!(marathon = %id, %previous, "marathon restarted");
        Ok(())
    }

    async fn live_state(&self, id: &str) -> Option<crate::state::SharedState> {
        let tracked = self.tracked.lock().await;
        tracked
            .get(id)
            .and_then(Tracked::running)
            .map(|h| h.shared().clone())
    }

    async fn current_state(&self, id: &str) -> Result<DurableMarathonState> {
        match self.live_state(id).await {
            Some(shared) => Ok(shared.snapshot().await),
            None => self.ctx.store.load_existing(id),
        }
    }

    fn alert(&self, message: String) {
        if self.settings.alert_channels.is_empty() {
            warn!("{message}");
            return;
        }
        spawn_alerts(
            self.ctx.notifier.clone(),
            &self.settings.alert_channels,
            message,
        );
    }

    async fn emit(&self, marathon_id: &str, event: MarathonEvent) {
        self.ctx.events.emit(marathon_id, event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::agent::{Agent, AgentRequest, AgentResponse};
    use crate::approval::ApprovalPolicy;
    use crate::config::EngineSettings;
    use crate::events::bounded;
    use crate::fs::mock::MockFileSystem;
    use crate::plan::{MarathonPlan, Milestone};
    use crate::state::{FileStateStore, StateStore};
    use crate::types::BackpressurePolicy;
    use std::pin::Pin;

    struct EchoAgent;

    impl Agent for EchoAgent {
        fn chat(
            &self,
            request: AgentRequest,
        ) -> Pin<Box<dyn Future<Output = Result<AgentResponse>> + Send + '_>> {
            Box::pin(async move {
                Ok(AgentResponse::text(format!(
                    "{} {} done",
                    request.session, request.milestone_id
                )))
            })
        }
    }

    fn context(store: Arc<dyn StateStore>) -> EngineContext {
        let (events, _rx) = bounded(64, BackpressurePolicy::DropOldest, Duration::ZERO);
        let settings = EngineSettings {
            heartbeat_interval: Duration::from_millis(20),
            heartbeat_timeout: Duration::from_millis(200),
            approval_poll_interval: Duration::from_millis(10),
            milestone_delay: Duration::ZERO,
            ..EngineSettings::default()
        };
        EngineContext::new(
            Arc::new(EchoAgent),
            store,
            events,
            settings,
            ApprovalPolicy::permissive(),
        )
    }

    fn crashed_state(ctx: &EngineContext) -> DurableMarathonState {
        let mut state = DurableMarathonState::new(
            "m-1",
            MarathonPlan::new("goal", vec![Milestone::new("a", "A")]),
            "/w",
            &ctx.settings,
        );
        state.heartbeat.last_heartbeat = Utc::now() - chrono::Duration::seconds(60);
        state
    }

    fn store() -> Arc<dyn StateStore> {
        Arc::new(FileStateStore::new("/state", Arc::new(MockFileSystem::new())))
    }

    #[tokio::test]
    async fn crashed_marathon_is_resumed_and_completes() {
        let store = store();
        let ctx = context(store.clone());
        store.save(&crashed_state(&ctx)).unwrap();

        let watchdog = Watchdog::new(ctx, WatchdogSettings::default());
        let reports = watchdog.scan_once().await.unwrap();
        assert_eq!(reports.len(), 1);
        assert!(reports[0].live);
        assert_eq!(reports[0].restarts, 1);

        assert_eq!(watchdog.join("m-1").await, Some(MarathonStatus::Completed));
        let state = store.load_existing("m-1").unwrap();
        assert_eq!(state.crash_count, 1);
    }

    #[tokio::test]
    async fn exhausted_restart_budget_marks_failed() {
        let store = store();
        let ctx = context(store.clone());
        store.save(&crashed_state(&ctx)).unwrap();

        let settings = WatchdogSettings {
            max_restarts: 0,
            ..WatchdogSettings::default()
        };
        let watchdog = Watchdog::new(ctx, settings);
        let reports = watchdog.scan_once().await.unwrap();
        assert_eq!(reports[0].display, DisplayStatus::Failed);
        assert!(!reports[0].live);

        let state = store.load_existing("m-1").unwrap();
        assert_eq!(state.status, MarathonStatus::Failed);
        assert!(!state.restart_eligible);
    }

    #[tokio::test]
    async fn without_auto_resume_crashes_still_count_against_the_budget() {
        let store = store();
        let ctx = context(store.clone());
        store.save(&crashed_state(&ctx)).unwrap();

        let settings = WatchdogSettings {
            auto_resume: false,
            max_restarts: 1,
            ..WatchdogSettings::default()
        };
        let watchdog = Watchdog::new(ctx, settings);
        // One stale stamp counts once.
        for _ in 0..2 {
            let reports = watchdog.scan_once().await.unwrap();
            assert_eq!(reports[0].display, DisplayStatus::Crashed);
            assert_eq!(reports[0].restarts, 1);
            assert!(!reports[0].live);
        }
        assert_eq!(store.load_existing("m-1").unwrap().crash_count, 1);

        // Someone ran it again outside the watchdog, and it died again.
        let mut state = store.load_existing("m-1").unwrap();
        state.heartbeat.last_heartbeat = Utc::now() - chrono::Duration::seconds(30);
        store.save(&state).unwrap();
        let reports = watchdog.scan_once().await.unwrap();
        assert_eq!(reports[0].display, DisplayStatus::Failed);
        assert!(!store.load_existing("m-1").unwrap().restart_eligible);
    }

    #[tokio::test]
    async fn pause_and_abort_without_live_executor_write_through() {
        let store = store();
        let ctx = context(store.clone());
        let mut state = crashed_state(&ctx);
        state.heartbeat.last_heartbeat = Utc::now();
        store.save(&state).unwrap();

        let watchdog = Watchdog::new(ctx, WatchdogSettings::default());
        watchdog.pause("m-1").await.unwrap();
        assert_eq!(store.load_existing("m-1").unwrap().status, MarathonStatus::Paused);

        watchdog.abort("m-1").await.unwrap();
        let state = store.load_existing("m-1").unwrap();
        assert_eq!(state.status, MarathonStatus::Failed);
        assert!(!state.restart_eligible);

        assert!(matches!(
            watchdog.pause("m-1").await,
            Err(MarathonError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn unknown_marathon_is_not_found() {
        let watchdog = Watchdog::new(context(store()), WatchdogSettings::default());
        assert!(matches!(
            watchdog.restart("nope").await,
            Err(MarathonError::MarathonNotFound(_))
        ));
    }
}
