// src/events/mod.rs

//! Typed progress events.
//!
//! Executors and the watchdog publish [`EventEnvelope`]s into a bounded
//! [`channel`]; a pump drains them into [`sinks`].

pub mod channel;
pub mod sinks;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::types::{DisplayStatus, MarathonStatus, RiskTier};

pub use channel::{EventPublisher, EventSubscriber, bounded};
pub use sinks::{ConsoleSink, EventSink, JsonLinesSink, spawn_event_pump};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MarathonEvent {
    Started {
        goal: String,
        milestones: usize,
    },
    MilestoneStarted {
        milestone_id: String,
        title: String,
    },
    MilestoneCompleted {
        milestone_id: String,
        elapsed_ms: u64,
    },
    MilestoneRetry {
        milestone_id: String,
        attempt: u32,
        error: String,
    },
    MilestoneFailed {
        milestone_id: String,
        error: String,
        skipped: Vec<String>,
    },
    LoopDetected {
        milestone_id: String,
        occurrences: usize,
    },
    ApprovalRequested {
        request_id: String,
        tier: RiskTier,
        description: String,
    },
    ApprovalResolved {
        request_id: String,
        approved: bool,
        by: Option<String>,
    },
    Heartbeat {
        last_action: Option<String>,
    },
    StatusChanged {
        status: MarathonStatus,
    },
    Finished {
        status: MarathonStatus,
        summary: String,
    },
    CrashDetected {
        display: DisplayStatus,
        heartbeat_age_ms: u64,
        restarts: u32,
    },
    Resumed {
        restart: u32,
        max_restarts: u32,
    },
    MaxRestartsExceeded {
        restarts: u32,
    },
}

impl MarathonEvent {
    pub fn is_heartbeat(&self) -> bool {
        matches!(self, MarathonEvent::Heartbeat { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventEnvelope {
    pub marathon_id: String,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: MarathonEvent,
}

impl EventEnvelope {
    pub fn new(marathon_id: impl Into<String>, event: MarathonEvent) -> Self {
        Self {
            marathon_id: marathon_id.into(),
            at: Utc::now(),
            event,
        }
    }
}
