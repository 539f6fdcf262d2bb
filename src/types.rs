use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle of a single milestone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MilestoneStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl MilestoneStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            MilestoneStatus::Completed | MilestoneStatus::Failed | MilestoneStatus::Skipped
        )
    }
}

impl Default for MilestoneStatus {
    fn default() -> Self {
        MilestoneStatus::Pending
    }
}

/// Status of the whole marathon as persisted on disk.
///
/// `Executing` and `WaitingHuman` alternate while the executor runs;
/// `Completed` and `Failed` are terminal; `Paused` is forced from outside
/// (operator pause or a rejected approval).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarathonStatus {
    Executing,
    WaitingHuman,
    Paused,
    Completed,
    Failed,
}

impl MarathonStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, MarathonStatus::Completed | MarathonStatus::Failed)
    }

    /// Whether an executor loop is expected to be driving this marathon.
    pub fn is_active(self) -> bool {
        matches!(self, MarathonStatus::Executing | MarathonStatus::WaitingHuman)
    }
}

impl fmt::Display for MarathonStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MarathonStatus::Executing => "executing",
            MarathonStatus::WaitingHuman => "waiting_human",
            MarathonStatus::Paused => "paused",
            MarathonStatus::Completed => "completed",
            MarathonStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    Pending,
    Completed,
    Failed,
}

/// Risk classification of a gated action. Ordered from least to most risky.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskTier {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for RiskTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RiskTier::Low => "low",
            RiskTier::Medium => "medium",
            RiskTier::High => "high",
            RiskTier::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// Approval request lifecycle. `Pending` moves to exactly one of the others.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
}

impl ApprovalStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ApprovalStatus::Pending)
    }
}

impl fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Rejected => "rejected",
            ApprovalStatus::Expired => "expired",
        };
        f.write_str(s)
    }
}

/// Status as reported by the watchdog, derived from the persisted state and
/// heartbeat freshness. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplayStatus {
    Executing,
    WaitingHuman,
    Stopped,
    Crashed,
    Paused,
    Completed,
    Failed,
}

impl fmt::Display for DisplayStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DisplayStatus::Executing => "executing",
            DisplayStatus::WaitingHuman => "waiting_human",
            DisplayStatus::Stopped => "stopped",
            DisplayStatus::Crashed => "crashed",
            DisplayStatus::Paused => "paused",
            DisplayStatus::Completed => "completed",
            DisplayStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// What the event channel does when a publisher hits a full queue.
///
/// - `DropOldest`: evict the oldest queued event and count it as dropped.
/// - `Block`: the publisher waits until the consumer frees a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressurePolicy {
    DropOldest,
    Block,
}

impl Default for BackpressurePolicy {
    fn default() -> Self {
        BackpressurePolicy::DropOldest
    }
}

impl FromStr for BackpressurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "drop_oldest" | "drop-oldest" => Ok(BackpressurePolicy::DropOldest),
            "block" => Ok(BackpressurePolicy::Block),
            other => Err(format!(
                "invalid backpressure policy: {other} (expected \"drop_oldest\" or \"block\")"
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn risk_tiers_are_ordered() {
        assert!(RiskTier::Critical > RiskTier::High);
        assert!(RiskTier::High > RiskTier::Medium);
        assert!(RiskTier::Medium > RiskTier::Low);
    }

    #[test]
    fn statuses_serialize_snake_case() {
        let json = serde_json::to_string(&MarathonStatus::WaitingHuman).unwrap();
        assert_eq!(json, "\"waiting_human\"");
        let json = serde_json::to_string(&MilestoneStatus::InProgress).unwrap();
        assert_eq!(json, "\"in_progress\"");
    }

    #[test]
    fn backpressure_parses_both_spellings() {
        assert_eq!(
            "drop-oldest".parse::<BackpressurePolicy>().unwrap(),
            BackpressurePolicy::DropOldest
        );
        assert_eq!(
            " Block ".parse::<BackpressurePolicy>().unwrap(),
            BackpressurePolicy::Block
        );
        assert!("lossy".parse::<BackpressurePolicy>().is_err());
    }
}
