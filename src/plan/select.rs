// src/plan/select.rs

//! Milestone selection: which milestone runs next, and when the plan is done.

use tracing::debug;

use crate::plan::graph::DagGraph;
use crate::plan::model::{MarathonPlan, Milestone, MilestoneId};
use crate::types::{MarathonStatus, MilestoneStatus};

/// Result of asking the plan what to do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    /// Run this milestone next.
    Next(MilestoneId),
    /// Nothing is eligible any more; the marathon ends with this status.
    Finished(MarathonStatus),
}

/// Whether every dependency of `milestone` is `completed`.
pub fn deps_satisfied(plan: &MarathonPlan, milestone: &Milestone) -> bool {
    milestone.dependencies.iter().all(|dep| {
        plan.milestone(dep)
            .map(|d| d.status == MilestoneStatus::Completed)
            .unwrap_or(false)
    })
}

/// Pick the next eligible milestone: the first `pending` one (in plan order)
/// whose dependencies are all `completed`.
///
/// When none is eligible the plan is finished: `completed` if every
/// milestone reached `completed`/`skipped` and none `failed`, otherwise
/// `failed` (a failure somewhere, or work that can never become eligible).
pub fn select_next(plan: &MarathonPlan) -> Selection {
    if let Some(next) = plan
        .milestones
        .iter()
        .find(|m| m.status == MilestoneStatus::Pending && deps_satisfied(plan, m))
    {
        debug!(milestone = %next.id, "dependencies satisfied; milestone eligible");
        return Selection::Next(next.id.clone());
    }

    let any_failed = plan
        .milestones
        .iter()
        .any(|m| m.status == MilestoneStatus::Failed);
    let all_terminal = plan.milestones.iter().all(|m| m.status.is_terminal());

    if !any_failed && all_terminal {
        Selection::Finished(MarathonStatus::Completed)
    } else {
        Selection::Finished(MarathonStatus::Failed)
    }
}

/// Mark every not-yet-run milestone downstream of `failed_id` as `skipped`.
///
/// Returns the ids that changed.
pub fn skip_dependents_of_failed(plan: &mut MarathonPlan, failed_id: &str) -> Vec<MilestoneId> {
    let graph = DagGraph::from_plan(plan);
    let mut skipped = Vec::new();

    for id in graph.transitive_dependents(failed_id) {
        if let Some(m) = plan.milestone_mut(&id) {
            if m.status == MilestoneStatus::Pending {
                m.status = MilestoneStatus::Skipped;
                m.last_error = Some(format!("upstream milestone '{failed_id}' failed"));
                debug!(milestone = %id, upstream = %failed_id, "skipping dependent of failed milestone");
                skipped.push(id);
            }
        }
    }

    skipped
}
