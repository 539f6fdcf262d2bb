// src/state/shared.rs

//! Single owner of a live marathon's state.
//!
//! The executor, its heartbeat task and in-process operator commands all
//! mutate the state through [`SharedState::update`], which serializes
//! mutation and persistence under one lock. Decisions written to disk by
//! another process (approvals, pause/abort) are folded back in before every
//! save, see [`absorb_external`].

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::state::model::{DurableMarathonState, LogLevel};
use crate::state::store::StateStore;
use crate::types::ApprovalStatus;

#[derive(Debug, Clone)]
pub struct SharedState {
    id: Arc<str>,
    inner: Arc<Mutex<DurableMarathonState>>,
    store: Arc<dyn StateStore>,
    max_log_entries: usize,
}

impl SharedState {
    pub fn new(state: DurableMarathonState, store: Arc<dyn StateStore>, max_log_entries: usize) -> Self {
        Self {
            id: Arc::from(state.id.as_str()),
            inner: Arc::new(Mutex::new(state)),
            store,
            max_log_entries,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn max_log_entries(&self) -> usize {
        self.max_log_entries
    }

    pub async fn snapshot(&self) -> DurableMarathonState {
        self.inner.lock().await.clone()
    }

    /// Read without persisting.
    pub async fn read<R>(&self, f: impl FnOnce(&DurableMarathonState) -> R) -> R {
        let guard = self.inner.lock().await;
        f(&guard)
    }

    /// Mutate, then persist while still holding the lock.
    ///
    /// A failed save is logged and recorded in the marathon's own log, but
    /// never surfaces to the caller: the in-memory state stays authoritative
    /// and the next successful save catches the disk up.
    pub async fn update<R>(&self, f: impl FnOnce(&mut DurableMarathonState) -> R) -> R {
        let mut guard = self.inner.lock().await;
        let out = f(&mut guard);
        self.persist_locked(&mut guard);
        out
    }

    /// Persist the current state unchanged (still merging external decisions).
    pub async fn persist(&self) -> bool {
        let mut guard = self.inner.lock().await;
        self.persist_locked(&mut guard)
    }

    fn persist_locked(&self, state: &mut DurableMarathonState) -> bool {
        match self.store.load(&self.id) {
            Ok(Some(disk)) => {
                let absorbed = absorb_external(state, &disk);
                if absorbed > 0 {
                    debug!(marathon = %self.id, absorbed, "merged external decisions from disk");
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(marathon = %self.id, error = %e, "could not read persisted state before save");
            }
        }

        state.updated_at = Utc::now();
        match self.store.save(state) {
            Ok(()) => true,
            Err(e) => {
                warn!(marathon = %self.id, error = %e, "failed to persist marathon state");
                state.log(
                    LogLevel::Warn,
                    format!("state persist failed: {e}"),
                    self.max_log_entries,
                );
                false
            }
        }
    }
}

/// Fold decisions made by other writers into the in-memory state.
///
/// - an approval still `pending` in memory but resolved on disk takes the
///   disk version (resolution is one-way, so disk can only be ahead),
/// - a control request newer than the last one acted on is adopted.
///
/// Returns how many items were absorbed.
pub fn absorb_external(mem: &mut DurableMarathonState, disk: &DurableMarathonState) -> usize {
    let mut absorbed = 0;

    for request in mem
        .approvals
        .iter_mut()
        .filter(|r| r.status == ApprovalStatus::Pending)
    {
        if let Some(resolved) = disk
            .approvals
            .iter()
            .find(|d| d.id == request.id && d.status.is_terminal())
        {
            *request = resolved.clone();
            absorbed += 1;
        }
    }

    if let Some(control) = &disk.control {
        let newer = mem
            .last_control_at
            .is_none_or(|acted| control.issued_at > acted);
        if mem.control.is_none() && newer {
            mem.control = Some(control.clone());
            absorbed += 1;
        }
    }

    absorbed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::{ApprovalRequest, ApprovalSubject};
    use crate::config::EngineSettings;
    use crate::fs::mock::MockFileSystem;
    use crate::plan::{MarathonPlan, Milestone};
    use crate::state::model::{ControlAction, ControlRequest};
    use crate::state::store::FileStateStore;
    use crate::types::RiskTier;

    fn setup() -> (SharedState, Arc<FileStateStore>, MockFileSystem) {
        let fs = MockFileSystem::new();
        let store = Arc::new(FileStateStore::new("state", Arc::new(fs.clone())));
        let plan = MarathonPlan::new("g", vec![Milestone::new("a", "A")]);
        let state = DurableMarathonState::new("m-1", plan, "/w", &EngineSettings::default());
        (SharedState::new(state, store.clone(), 50), store, fs)
    }

    fn pending_request(id: &str) -> ApprovalRequest {
        ApprovalRequest::new(
            id,
            "m-1",
            ApprovalSubject::milestone("a"),
            "rm -rf /tmp/x",
            RiskTier::High,
            Vec::new(),
            None,
            false,
        )
    }

    #[tokio::test]
    async fn update_persists_each_mutation() {
        let (shared, store, _fs) = setup();
        shared.update(|s| s.crash_count = 2).await;
        assert_eq!(store.load("m-1").unwrap().unwrap().crash_count, 2);
    }

    #[tokio::test]
    async fn persist_failure_is_not_fatal() {
        let (shared, store, fs) = setup();
        shared.update(|s| s.crash_count = 1).await;

        fs.set_fail_writes(true);
        shared.update(|s| s.crash_count = 5).await;
        let snapshot = shared.snapshot().await;
        assert_eq!(snapshot.crash_count, 5);
        assert!(snapshot
            .latest_log_line()
            .is_some_and(|l| l.contains("persist failed")));
        assert_eq!(store.load("m-1").unwrap().unwrap().crash_count, 1);

        fs.set_fail_writes(false);
        assert!(shared.persist().await);
        assert_eq!(store.load("m-1").unwrap().unwrap().crash_count, 5);
    }

    #[tokio::test]
    async fn external_resolution_and_control_are_merged() {
        let (shared, store, _fs) = setup();
        shared.update(|s| s.approvals.push(pending_request("r1"))).await;

        // Another process resolves the request and asks for a pause.
        let mut disk = store.load("m-1").unwrap().unwrap();
        disk.approvals[0]
            .approve("alice", Utc::now())
            .unwrap();
        disk.control = Some(ControlRequest {
            action: ControlAction::Pause,
            issued_at: Utc::now(),
            issued_by: None,
        });
        store.save(&disk).unwrap();

        shared.persist().await;
        let merged = shared.snapshot().await;
        assert_eq!(merged.approvals[0].status, ApprovalStatus::Approved);
        assert_eq!(merged.approvals[0].resolved_by.as_deref(), Some("alice"));
        assert!(merged.control.is_some());
    }

    #[tokio::test]
    async fn consumed_control_is_not_readopted() {
        let (shared, store, _fs) = setup();
        let issued_at = Utc::now();
        let mut disk = store.load("m-1").ok().flatten().unwrap_or(shared.snapshot().await);
        disk.control = Some(ControlRequest {
            action: ControlAction::Abort,
            issued_at,
            issued_by: None,
        });
        store.save(&disk).unwrap();

        shared
            .update(|s| {
                s.control = None;
                s.last_control_at = Some(issued_at);
            })
            .await;
        assert!(shared.snapshot().await.control.is_none());
    }
}
