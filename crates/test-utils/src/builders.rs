use std::time::Duration;

use marathon::config::{EngineSettings, WatchdogSettings};
use marathon::plan::{MarathonPlan, Milestone};

/// Builder for `Milestone` to simplify test setup.
pub struct MilestoneBuilder {
    milestone: Milestone,
}

impl MilestoneBuilder {
    pub fn new(id: &str) -> Self {
        Self {
            milestone: Milestone::new(id, format!("Milestone {id}")),
        }
    }

    pub fn title(mut self, title: &str) -> Self {
        self.milestone.title = title.to_string();
        self
    }

    pub fn description(mut self, description: &str) -> Self {
        self.milestone.description = description.to_string();
        self
    }

    pub fn after(mut self, dep: &str) -> Self {
        self.milestone.dependencies.push(dep.to_string());
        self
    }

    pub fn artifact(mut self, path: &str) -> Self {
        self.milestone.artifacts.push(path.into());
        self
    }

    pub fn verify(mut self, step: &str) -> Self {
        self.milestone.verification_steps.push(step.to_string());
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.milestone.max_retries = n;
        self
    }

    pub fn build(self) -> Milestone {
        self.milestone
    }
}

/// Builder for `MarathonPlan`.
pub struct PlanBuilder {
    plan: MarathonPlan,
}

impl PlanBuilder {
    pub fn new(goal: &str) -> Self {
        Self {
            plan: MarathonPlan::new(goal, Vec::new()),
        }
    }

    pub fn milestone(mut self, m: MilestoneBuilder) -> Self {
        self.plan.milestones.push(m.build());
        self
    }

    /// Shorthand for a milestone with only dependencies.
    pub fn step(self, id: &str, after: &[&str]) -> Self {
        let m = after
            .iter()
            .fold(MilestoneBuilder::new(id), |m, dep| m.after(dep));
        self.milestone(m)
    }

    pub fn thinking(mut self, phase: &str, hint: &str) -> Self {
        self.plan.thinking.insert(phase.to_string(), hint.to_string());
        self
    }

    pub fn build(self) -> MarathonPlan {
        self.plan
    }
}

/// Engine timings short enough for tests: 20ms heartbeats, 200ms crash
/// threshold, no delay between milestones.
pub fn fast_engine_settings() -> EngineSettings {
    EngineSettings {
        heartbeat_interval: Duration::from_millis(20),
        heartbeat_timeout: Duration::from_millis(200),
        approval_poll_interval: Duration::from_millis(10),
        milestone_delay: Duration::ZERO,
        ..EngineSettings::default()
    }
}

pub fn fast_watchdog_settings(max_restarts: u32) -> WatchdogSettings {
    WatchdogSettings {
        scan_interval: Duration::from_millis(25),
        max_restarts,
        auto_resume: true,
        alert_channels: vec!["ops".to_string()],
    }
}
