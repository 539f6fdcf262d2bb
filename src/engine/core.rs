// src/engine/core.rs

//! Pure executor state machine.
//!
//! Every decision and state transition of the executor lives here as a
//! plain function over [`DurableMarathonState`]: no Tokio, no agent, no
//! filesystem. The async shell in [`crate::engine::executor`] calls these
//! under [`SharedState::update`](crate::state::SharedState::update) and
//! performs the IO in between.

use chrono::Utc;

use crate::approval::expire_pending;
use crate::plan::{MilestoneId, Selection, select_next, skip_dependents_of_failed};
use crate::state::{ControlAction, ControlRequest, DurableMarathonState, LogLevel};
use crate::types::{MarathonStatus, MilestoneStatus};

#[derive(Debug, Clone, PartialEq)]
pub enum StopReason {
    /// An operator asked to pause or abort.
    Control(ControlRequest),
    /// The marathon is no longer active (paused, completed or failed).
    Inactive(MarathonStatus),
}

/// What the executor loop should do next.
#[derive(Debug, Clone, PartialEq)]
pub enum CoreStep {
    Stop(StopReason),
    /// Block until this approval request resolves.
    AwaitApproval { request_id: String },
    Execute(MilestoneId),
    Finish(MarathonStatus),
}

/// Outcome of recording a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureStep {
    /// Budget left; `attempt` is the new retry count.
    Retry { attempt: u32 },
    /// Out of retries (or not retryable). Lists dependents marked skipped.
    Failed { skipped: Vec<MilestoneId> },
}

/// Decide the next step from the current state.
///
/// Order matters: terminal states end the loop, then operator control, then
/// pending approvals, then milestone selection.
pub fn decide(state: &DurableMarathonState) -> CoreStep {
    if state.status.is_terminal() {
        return CoreStep::Stop(StopReason::Inactive(state.status));
    }
    if let Some(control) = &state.control {
        return CoreStep::Stop(StopReason::Control(control.clone()));
    }
    if !state.status.is_active() {
        return CoreStep::Stop(StopReason::Inactive(state.status));
    }
    if let Some(request) = state.pending_approvals().next() {
        return CoreStep::AwaitApproval {
            request_id: request.id.clone(),
        };
    }
    match select_next(&state.plan) {
        Selection::Next(id) => CoreStep::Execute(id),
        Selection::Finished(status) => CoreStep::Finish(status),
    }
}

/// Mark `id` in progress. Returns its title, or `None` for an unknown id.
pub fn begin_milestone(state: &mut DurableMarathonState, id: &str, max_logs: usize) -> Option<String> {
    let milestone = state.plan.milestone_mut(id)?;
    milestone.status = MilestoneStatus::InProgress;
    milestone.started_at = Some(Utc::now());
    let title = milestone.title.clone();
    state.log(LogLevel::Info, format!("milestone {id} started: {title}"), max_logs);
    Some(title)
}

pub fn complete_milestone(state: &mut DurableMarathonState, id: &str, elapsed_ms: u64, max_logs: usize) {
    if let Some(milestone) = state.plan.milestone_mut(id) {
        milestone.status = MilestoneStatus::Completed;
        milestone.completed_at = Some(Utc::now());
        milestone.actual_duration_ms = Some(elapsed_ms);
        milestone.last_error = None;
    }
    let progress = state.plan.progress_summary();
    state.log(
        LogLevel::Info,
        format!("milestone {id} completed in {elapsed_ms}ms ({progress})"),
        max_logs,
    );
}

/// Record a failed attempt of `id`: consume a retry if budget remains,
/// otherwise fail it and skip everything downstream.
pub fn record_failure(
    state: &mut DurableMarathonState,
    id: &str,
    error: &str,
    retryable: bool,
    max_logs: usize,
) -> FailureStep {
    let Some(milestone) = state.plan.milestone_mut(id) else {
        return FailureStep::Failed {
            skipped: Vec::new(),
        };
    };
    milestone.last_error = Some(error.to_string());

    if retryable && milestone.retry_count < milestone.max_retries {
        milestone.retry_count += 1;
        let attempt = milestone.retry_count;
        let max = milestone.max_retries;
        state.log(
            LogLevel::Warn,
            format!("milestone {id} attempt failed ({error}); retry {attempt}/{max}"),
            max_logs,
        );
        return FailureStep::Retry { attempt };
    }

    milestone.status = MilestoneStatus::Failed;
    let skipped = skip_dependents_of_failed(&mut state.plan, id);
    state.log(LogLevel::Error, format!("milestone {id} failed: {error}"), max_logs);
    if !skipped.is_empty() {
        state.log(
            LogLevel::Warn,
            format!("skipped dependents of {id}: {}", skipped.join(", ")),
            max_logs,
        );
    }
    FailureStep::Failed { skipped }
}

/// Act on an operator control request and consume it.
pub fn apply_control(
    state: &mut DurableMarathonState,
    request: &ControlRequest,
    max_logs: usize,
) -> MarathonStatus {
    state.control = None;
    state.last_control_at = Some(request.issued_at);
    let expired = expire_pending(state, Utc::now());

    for m in &mut state.plan.milestones {
        if m.status == MilestoneStatus::InProgress {
            m.status = MilestoneStatus::Pending;
            m.started_at = None;
        }
    }

    let (status, verb) = match request.action {
        ControlAction::Pause => (MarathonStatus::Paused, "paused"),
        ControlAction::Abort => {
            state.restart_eligible = false;
            (MarathonStatus::Failed, "aborted")
        }
    };
    state.status = status;

    let by = request.issued_by.as_deref().unwrap_or("operator");
    let mut line = format!("marathon {verb} by {by}");
    if expired > 0 {
        line.push_str(&format!(" ({expired} pending approval(s) expired)"));
    }
    state.log(LogLevel::Warn, line, max_logs);
    status
}

/// Record the final status once no milestone is eligible any more.
pub fn finish(state: &mut DurableMarathonState, status: MarathonStatus, max_logs: usize) -> String {
    state.status = status;
    let summary = state.plan.progress_summary();
    let level = if status == MarathonStatus::Completed {
        LogLevel::Info
    } else {
        LogLevel::Error
    };
    state.log(level, format!("marathon {status}: {summary}"), max_logs);
    summary
}
