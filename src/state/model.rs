// src/state/model.rs

//! The durable aggregate persisted once per marathon.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::approval::ApprovalRequest;
use crate::config::EngineSettings;
use crate::plan::{MarathonPlan, MilestoneId};
use crate::types::{ApprovalStatus, CheckpointStatus, MarathonStatus, MilestoneStatus};

/// Checkpoint inputs/outputs are truncated to this many characters.
pub const MAX_CHECKPOINT_TEXT: usize = 2_000;

/// Liveness stamp refreshed by the heartbeat while executing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatState {
    pub enabled: bool,
    pub interval_ms: u64,
    pub timeout_ms: u64,
    pub last_heartbeat: DateTime<Utc>,
    #[serde(default)]
    pub last_action: Option<String>,
}

impl HeartbeatState {
    pub fn new(settings: &EngineSettings, now: DateTime<Utc>) -> Self {
        Self {
            enabled: true,
            interval_ms: settings.heartbeat_interval.as_millis() as u64,
            timeout_ms: settings.heartbeat_timeout.as_millis() as u64,
            last_heartbeat: now,
            last_action: None,
        }
    }

    /// Milliseconds since the last heartbeat (zero if the clock went backwards).
    pub fn age_ms(&self, now: DateTime<Utc>) -> u64 {
        (now - self.last_heartbeat).num_milliseconds().max(0) as u64
    }

    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        self.age_ms(now) > self.timeout_ms
    }
}

/// Known shapes of the work recorded by a checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionKind {
    Execution,
    Verification,
    Recovery { attempt: u32, failure: String },
    Corrective { reason: String },
}

/// Checkpoint payload: one of the known shapes, or anything else written by
/// a newer version, kept verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CheckpointPayload {
    Known(ActionKind),
    Opaque(serde_json::Value),
}

impl From<ActionKind> for CheckpointPayload {
    fn from(kind: ActionKind) -> Self {
        CheckpointPayload::Known(kind)
    }
}

/// One record per delegated agent invocation. Appended before the call,
/// updated in place after it, never removed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionCheckpoint {
    pub id: String,
    /// Strictly increasing within a marathon.
    pub action_index: u64,
    pub milestone_id: MilestoneId,
    pub payload: CheckpointPayload,
    pub input: String,
    #[serde(default)]
    pub output: Option<String>,
    pub status: CheckpointStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub at: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlAction {
    Pause,
    Abort,
}

/// Operator request recorded on the state so that whichever executor owns
/// the marathon (in this process or another) acts on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlRequest {
    pub action: ControlAction,
    pub issued_at: DateTime<Utc>,
    #[serde(default)]
    pub issued_by: Option<String>,
}

/// Aggregate root: everything needed to resume a marathon from disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DurableMarathonState {
    pub id: String,
    pub plan: MarathonPlan,
    pub status: MarathonStatus,
    pub heartbeat: HeartbeatState,
    #[serde(default)]
    pub checkpoints: Vec<ActionCheckpoint>,
    #[serde(default)]
    pub approvals: Vec<ApprovalRequest>,
    #[serde(default)]
    pub crash_count: u32,
    pub restart_eligible: bool,
    pub working_dir: PathBuf,
    #[serde(default)]
    pub logs: Vec<LogEntry>,
    /// Running summary of what earlier milestones produced.
    #[serde(default)]
    pub context_summary: String,
    #[serde(default)]
    pub continuity_token: Option<String>,
    #[serde(default)]
    pub control: Option<ControlRequest>,
    /// `issued_at` of the last control request an executor acted on.
    #[serde(default)]
    pub last_control_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DurableMarathonState {
    pub fn new(
        id: impl Into<String>,
        plan: MarathonPlan,
        working_dir: impl Into<PathBuf>,
        settings: &EngineSettings,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            plan,
            status: MarathonStatus::Executing,
            heartbeat: HeartbeatState::new(settings, now),
            checkpoints: Vec::new(),
            approvals: Vec::new(),
            crash_count: 0,
            restart_eligible: true,
            working_dir: working_dir.into(),
            logs: Vec::new(),
            context_summary: String::new(),
            continuity_token: None,
            control: None,
            last_control_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Append to the marathon's own log stream, keeping at most `max` entries.
    pub fn log(&mut self, level: LogLevel, message: impl Into<String>, max: usize) {
        self.logs.push(LogEntry {
            at: Utc::now(),
            level,
            message: message.into(),
        });
        if self.logs.len() > max {
            let excess = self.logs.len() - max;
            self.logs.drain(..excess);
        }
    }

    pub fn latest_log_line(&self) -> Option<&str> {
        self.logs.last().map(|e| e.message.as_str())
    }

    pub fn next_action_index(&self) -> u64 {
        self.checkpoints
            .iter()
            .map(|c| c.action_index + 1)
            .max()
            .unwrap_or(0)
    }

    /// Append a pending checkpoint and return its action index.
    pub fn begin_checkpoint(
        &mut self,
        milestone_id: &str,
        payload: CheckpointPayload,
        input: &str,
    ) -> u64 {
        let action_index = self.next_action_index();
        self.checkpoints.push(ActionCheckpoint {
            id: uuid::Uuid::new_v4().to_string(),
            action_index,
            milestone_id: milestone_id.to_string(),
            payload,
            input: truncate_text(input, MAX_CHECKPOINT_TEXT),
            output: None,
            status: CheckpointStatus::Pending,
            started_at: Utc::now(),
            finished_at: None,
        });
        action_index
    }

    /// Update the checkpoint in place. Unknown indices are ignored.
    pub fn finish_checkpoint(&mut self, action_index: u64, output: &str, status: CheckpointStatus) {
        if let Some(cp) = self
            .checkpoints
            .iter_mut()
            .find(|c| c.action_index == action_index)
        {
            cp.output = Some(truncate_text(output, MAX_CHECKPOINT_TEXT));
            cp.status = status;
            cp.finished_at = Some(Utc::now());
        }
    }

    pub fn approval(&self, request_id: &str) -> Option<&ApprovalRequest> {
        self.approvals.iter().find(|r| r.id == request_id)
    }

    pub fn approval_mut(&mut self, request_id: &str) -> Option<&mut ApprovalRequest> {
        self.approvals.iter_mut().find(|r| r.id == request_id)
    }

    pub fn pending_approvals(&self) -> impl Iterator<Item = &ApprovalRequest> {
        self.approvals
            .iter()
            .filter(|r| r.status == ApprovalStatus::Pending)
    }

    /// Move `status` and stamp the heartbeat when (re-)entering `executing`,
    /// so time spent waiting on a human does not read as a crash.
    pub fn set_status(&mut self, status: MarathonStatus) {
        if status == MarathonStatus::Executing && self.status != MarathonStatus::Executing {
            self.heartbeat.last_heartbeat = Utc::now();
        }
        self.status = status;
    }

    /// Make a state read back from disk safe to hand to a fresh executor.
    ///
    /// - a milestone caught `in_progress` goes back to `pending`
    ///   (it is re-attempted; completed ones never are),
    /// - checkpoints left `pending` by the dead process are marked `failed`,
    /// - status returns to `executing`, unless a pending approval keeps it
    ///   in `waiting_human`,
    /// - the heartbeat is stamped.
    pub fn prepare_for_resume(&mut self) {
        for m in &mut self.plan.milestones {
            if m.status == MilestoneStatus::InProgress {
                m.status = MilestoneStatus::Pending;
                m.started_at = None;
            }
        }
        for cp in &mut self.checkpoints {
            if cp.status == CheckpointStatus::Pending {
                cp.status = CheckpointStatus::Failed;
                cp.output = Some("interrupted".to_string());
                cp.finished_at = Some(Utc::now());
            }
        }
        let waiting = self.pending_approvals().next().is_some();
        self.status = if waiting {
            MarathonStatus::WaitingHuman
        } else {
            MarathonStatus::Executing
        };
        self.heartbeat.last_heartbeat = Utc::now();
    }

    /// Operator restart: like [`prepare_for_resume`](Self::prepare_for_resume),
    /// and additionally gives `failed`/`skipped` milestones a fresh budget.
    pub fn reset_for_manual_restart(&mut self) {
        for m in &mut self.plan.milestones {
            if matches!(m.status, MilestoneStatus::Failed | MilestoneStatus::Skipped) {
                m.reset();
            }
        }
        self.control = None;
        self.restart_eligible = true;
        self.prepare_for_resume();
    }
}

/// Truncate to at most `max` characters, on a char boundary.
pub fn truncate_text(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        None => s.to_string(),
        Some((idx, _)) => {
            let mut out = s[..idx].to_string();
            out.push('…');
            out
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::Milestone;

    fn state() -> DurableMarathonState {
        let plan = MarathonPlan::new(
            "goal",
            vec![Milestone::new("a", "A"), Milestone::new("b", "B")],
        );
        DurableMarathonState::new("m-1", plan, "/work", &EngineSettings::default())
    }

    #[test]
    fn action_index_strictly_increases() {
        let mut s = state();
        let first = s.begin_checkpoint("a", ActionKind::Execution.into(), "do a");
        let second = s.begin_checkpoint("a", ActionKind::Verification.into(), "check a");
        s.finish_checkpoint(first, "ok", CheckpointStatus::Completed);
        let third = s.begin_checkpoint("b", ActionKind::Execution.into(), "do b");
        assert_eq!((first, second, third), (0, 1, 2));
        assert_eq!(s.checkpoints[0].status, CheckpointStatus::Completed);
        assert_eq!(s.checkpoints[1].status, CheckpointStatus::Pending);
    }

    #[test]
    fn log_stream_is_bounded() {
        let mut s = state();
        for i in 0..10 {
            s.log(LogLevel::Info, format!("line {i}"), 3);
        }
        assert_eq!(s.logs.len(), 3);
        assert_eq!(s.latest_log_line(), Some("line 9"));
    }

    #[test]
    fn resume_requeues_in_progress_and_interrupted_checkpoints() {
        let mut s = state();
        s.plan.milestones[0].status = MilestoneStatus::Completed;
        s.plan.milestones[1].status = MilestoneStatus::InProgress;
        s.begin_checkpoint("b", ActionKind::Execution.into(), "do b");
        s.status = MarathonStatus::Executing;

        s.prepare_for_resume();

        assert_eq!(s.plan.milestones[0].status, MilestoneStatus::Completed);
        assert_eq!(s.plan.milestones[1].status, MilestoneStatus::Pending);
        assert_eq!(s.checkpoints[0].status, CheckpointStatus::Failed);
        assert_eq!(s.status, MarathonStatus::Executing);
    }

    #[test]
    fn manual_restart_resets_failed_milestones() {
        let mut s = state();
        s.plan.milestones[0].status = MilestoneStatus::Failed;
        s.plan.milestones[0].retry_count = 2;
        s.plan.milestones[1].status = MilestoneStatus::Skipped;
        s.status = MarathonStatus::Failed;
        s.restart_eligible = false;

        s.reset_for_manual_restart();

        assert!(s
            .plan
            .milestones
            .iter()
            .all(|m| m.status == MilestoneStatus::Pending && m.retry_count == 0));
        assert!(s.restart_eligible);
        assert_eq!(s.status, MarathonStatus::Executing);
    }

    #[test]
    fn unknown_payload_shapes_survive_round_trip() {
        let json = r#"{"kind":"tool_call","tool":"browser"}"#;
        let payload: CheckpointPayload = serde_json::from_str(json).unwrap();
        assert!(matches!(payload, CheckpointPayload::Opaque(_)));
        assert_eq!(
            serde_json::to_value(&payload).unwrap(),
            serde_json::from_str::<serde_json::Value>(json).unwrap()
        );

        let known: CheckpointPayload =
            serde_json::from_str(r#"{"kind":"recovery","attempt":2,"failure":"x"}"#).unwrap();
        assert_eq!(
            known,
            CheckpointPayload::Known(ActionKind::Recovery {
                attempt: 2,
                failure: "x".into()
            })
        );
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_text("héllo", 2), "hé…");
        assert_eq!(truncate_text("short", 10), "short");
    }

    #[test]
    fn staleness_uses_timeout() {
        let mut hb = HeartbeatState::new(&EngineSettings::default(), Utc::now());
        assert!(!hb.is_stale(Utc::now()));
        hb.last_heartbeat = Utc::now() - chrono::Duration::seconds(121);
        assert!(hb.is_stale(Utc::now()));
    }
}
