// src/heartbeat.rs

//! Periodic liveness stamp for a running marathon.
//!
//! The emitter only stamps while the marathon is `executing`; waiting on a
//! human, paused or finished marathons keep their last stamp. The watchdog
//! compares that stamp against the heartbeat timeout to detect crashes.

use std::time::Duration;

use chrono::Utc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace};

use crate::events::{EventPublisher, MarathonEvent};
use crate::state::SharedState;
use crate::types::MarathonStatus;

/// Handle to the background heartbeat task.
#[derive(Debug)]
pub struct HeartbeatEmitter {
    stop_tx: Option<oneshot::Sender<()>>,
    join: JoinHandle<()>,
}

impl HeartbeatEmitter {
    /// Spawn the heartbeat loop. The first beat happens one `interval` after
    /// start; callers stamp the heartbeat themselves when they begin work.
    pub fn start(shared: SharedState, interval: Duration, events: EventPublisher) -> Self {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            debug!(marathon = %shared.id(), ?interval, "heartbeat started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        beat(&shared, &events).await;
                    }
                    _ = &mut stop_rx => break,
                }
            }
            debug!(marathon = %shared.id(), "heartbeat stopped");
        });

        Self {
            stop_tx: Some(stop_tx),
            join,
        }
    }

    /// Stop the loop and wait for it to exit. Safe to call once the task has
    /// already finished.
    pub async fn stop(mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        let _ = (&mut self.join).await;
    }
}

impl Drop for HeartbeatEmitter {
    fn drop(&mut self) {
        if self.stop_tx.is_some() {
            self.join.abort();
        }
    }
}

/// One heartbeat tick. Returns `true` if the state was stamped.
pub async fn beat(shared: &SharedState, events: &EventPublisher) -> bool {
    let stamped = shared
        .update(|s| {
            if s.status != MarathonStatus::Executing {
                return None;
            }
            s.heartbeat.last_heartbeat = Utc::now();
            s.heartbeat.last_action = s.latest_log_line().map(str::to_string);
            Some(s.heartbeat.last_action.clone())
        })
        .await;

    match stamped {
        Some(last_action) => {
            trace!(marathon = %shared.id(), "heartbeat");
            events
                .emit(shared.id(), MarathonEvent::Heartbeat { last_action })
                .await;
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::config::EngineSettings;
    use crate::events::bounded;
    use crate::fs::mock::MockFileSystem;
    use crate::plan::{MarathonPlan, Milestone};
    use crate::state::{DurableMarathonState, FileStateStore, LogLevel, StateStore};
    use crate::types::BackpressurePolicy;

    fn shared() -> (SharedState, Arc<FileStateStore>) {
        let store = Arc::new(FileStateStore::new("state", Arc::new(MockFileSystem::new())));
        let plan = MarathonPlan::new("g", vec![Milestone::new("a", "A")]);
        let mut state = DurableMarathonState::new("m-1", plan, "/w", &EngineSettings::default());
        state.heartbeat.last_heartbeat = Utc::now() - chrono::Duration::minutes(10);
        state.log(LogLevel::Info, "writing tests", 10);
        (SharedState::new(state, store.clone(), 10), store)
    }

    #[tokio::test]
    async fn beat_stamps_only_while_executing() {
        let (shared, store) = shared();
        let (tx, mut rx) = bounded(8, BackpressurePolicy::DropOldest, Duration::ZERO);

        assert!(beat(&shared, &tx).await);
        let persisted = store.load("m-1").unwrap().unwrap();
        assert!(!persisted.heartbeat.is_stale(Utc::now()));
        assert_eq!(persisted.heartbeat.last_action.as_deref(), Some("writing tests"));
        assert!(rx.try_recv().unwrap().event.is_heartbeat());

        shared.update(|s| s.status = MarathonStatus::WaitingHuman).await;
        assert!(!beat(&shared, &tx).await);
        assert!(rx.try_recv().is_none());
    }

    #[tokio::test]
    async fn emitter_ticks_until_stopped() {
        let (shared, _store) = shared();
        let (tx, mut rx) = bounded(64, BackpressurePolicy::DropOldest, Duration::ZERO);

        let emitter = HeartbeatEmitter::start(shared.clone(), Duration::from_millis(10), tx);
        tokio::time::sleep(Duration::from_millis(55)).await;
        emitter.stop().await;

        let mut beats = 0;
        while rx.try_recv().is_some() {
            beats += 1;
        }
        assert!(beats >= 2, "expected several beats, got {beats}");
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(rx.try_recv().is_none());
    }
}
