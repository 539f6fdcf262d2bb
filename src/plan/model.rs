// src/plan/model.rs

//! Milestone and plan data types.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::MilestoneStatus;

/// Canonical milestone identifier type.
pub type MilestoneId = String;

pub const DEFAULT_MAX_RETRIES: u32 = 2;

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

/// One unit of the plan, driven to completion by the executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Milestone {
    pub id: MilestoneId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: MilestoneStatus,
    /// Milestones that must be `completed` before this one may start.
    #[serde(default)]
    pub dependencies: Vec<MilestoneId>,
    /// Paths (relative to the working directory) that must exist for the
    /// milestone to count as done when it has no verification steps.
    #[serde(default)]
    pub artifacts: Vec<PathBuf>,
    #[serde(default)]
    pub verification_steps: Vec<String>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Wall-clock time of the successful run, in milliseconds.
    #[serde(default)]
    pub actual_duration_ms: Option<u64>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl Milestone {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            status: MilestoneStatus::Pending,
            dependencies: Vec::new(),
            artifacts: Vec::new(),
            verification_steps: Vec::new(),
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            started_at: None,
            completed_at: None,
            actual_duration_ms: None,
            last_error: None,
        }
    }

    /// Human readable description of what executing this milestone does.
    /// This is what the approval policy classifies.
    pub fn action_description(&self) -> String {
        if self.description.is_empty() {
            self.title.clone()
        } else {
            format!("{}: {}", self.title, self.description)
        }
    }

    /// Put the milestone back into a fresh `pending` state, keeping its
    /// definition.
    pub fn reset(&mut self) {
        self.status = MilestoneStatus::Pending;
        self.retry_count = 0;
        self.started_at = None;
        self.completed_at = None;
        self.actual_duration_ms = None;
        self.last_error = None;
    }
}

/// Ordered milestone plan for one marathon.
///
/// Created once before execution starts. Only the embedded milestone
/// progress fields change afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarathonPlan {
    pub goal: String,
    pub milestones: Vec<Milestone>,
    /// Per-phase strategy hints, passed through to prompts untouched.
    #[serde(default)]
    pub thinking: BTreeMap<String, String>,
}

impl MarathonPlan {
    pub fn new(goal: impl Into<String>, milestones: Vec<Milestone>) -> Self {
        Self {
            goal: goal.into(),
            milestones,
            thinking: BTreeMap::new(),
        }
    }

    pub fn milestone(&self, id: &str) -> Option<&Milestone> {
        self.milestones.iter().find(|m| m.id == id)
    }

    pub fn milestone_mut(&mut self, id: &str) -> Option<&mut Milestone> {
        self.milestones.iter_mut().find(|m| m.id == id)
    }

    pub fn count_with_status(&self, status: MilestoneStatus) -> usize {
        self.milestones.iter().filter(|m| m.status == status).count()
    }

    pub fn in_progress(&self) -> Option<&Milestone> {
        self.milestones
            .iter()
            .find(|m| m.status == MilestoneStatus::InProgress)
    }

    /// One-line progress summary, e.g. `"2/5 completed, 1 failed"`.
    pub fn progress_summary(&self) -> String {
        let completed = self.count_with_status(MilestoneStatus::Completed);
        let failed = self.count_with_status(MilestoneStatus::Failed);
        let mut summary = format!("{}/{} completed", completed, self.milestones.len());
        if failed > 0 {
            summary.push_str(&format!(", {failed} failed"));
        }
        summary
    }
}
