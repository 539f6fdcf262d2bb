// src/watchdog/classify.rs

use chrono::{DateTime, Utc};

use crate::state::DurableMarathonState;
use crate::types::{DisplayStatus, MarathonStatus};

/// Operator-facing status derived from the persisted status and heartbeat.
///
/// Only `executing` marathons can read as crashed: waiting on a human,
/// paused and terminal states never stamp the heartbeat. The staleness
/// timeout is the one persisted with the marathon, not the reader's config.
pub fn derive_display_status(state: &DurableMarathonState, now: DateTime<Utc>) -> DisplayStatus {
    match state.status {
        MarathonStatus::Completed => DisplayStatus::Completed,
        MarathonStatus::Failed => DisplayStatus::Failed,
        MarathonStatus::Paused => DisplayStatus::Paused,
        MarathonStatus::WaitingHuman => DisplayStatus::WaitingHuman,
        MarathonStatus::Executing if !state.heartbeat.enabled => DisplayStatus::Stopped,
        MarathonStatus::Executing if state.heartbeat.is_stale(now) => DisplayStatus::Crashed,
        MarathonStatus::Executing => DisplayStatus::Executing,
    }
}
