// src/approval/gate.rs

//! Approval gate: raise requests, poll them, resolve them.
//!
//! The state-level functions ([`approve_request`], [`reject_request`],
//! [`poll_request`], [`expire_pending`]) work on a plain
//! [`DurableMarathonState`], so they apply equally to a live marathon (via
//! [`SharedState::update`]) and to one loaded straight from the store.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::approval::policy::{ApprovalPolicy, RiskAssessment};
use crate::approval::request::{ApprovalRequest, ApprovalSubject};
use crate::errors::{MarathonError, Result};
use crate::events::{EventPublisher, MarathonEvent};
use crate::notify::{Notifier, notify_best_effort};
use crate::state::{DurableMarathonState, LogLevel, SharedState};
use crate::types::{ApprovalStatus, MarathonStatus};

/// Result of checking a request during the executor's wait loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Pending,
    Approved { by: String },
    Rejected { reason: String },
    /// Withdrawn (marathon paused/aborted while waiting).
    Expired,
    /// No request with that id on this marathon.
    Missing,
}

/// Whether a milestone may start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    /// No approval needed, or an approval for it already exists.
    Proceed,
    /// Blocked on this request.
    Wait { request_id: String },
}

/// Classifies actions and raises approval requests for a marathon.
#[derive(Clone)]
pub struct ApprovalGate {
    policy: Arc<ApprovalPolicy>,
    notifier: Arc<dyn Notifier>,
    events: EventPublisher,
    fallback_channel: Option<String>,
}

impl ApprovalGate {
    pub fn new(
        policy: Arc<ApprovalPolicy>,
        notifier: Arc<dyn Notifier>,
        events: EventPublisher,
        fallback_channel: Option<String>,
    ) -> Self {
        Self {
            policy,
            notifier,
            events,
            fallback_channel,
        }
    }

    pub fn assess(&self, action: &str) -> Option<RiskAssessment> {
        self.policy.assess(action)
    }

    /// Decide whether `milestone_id` may start, raising a request if needed.
    ///
    /// A milestone whose most recent request was approved proceeds; one with
    /// a pending request keeps waiting on it; otherwise (no request yet, or
    /// the last one was rejected/expired) a new request is raised.
    pub async fn check_milestone(&self, shared: &SharedState, milestone_id: &str) -> Result<GateDecision> {
        let (action, latest) = shared
            .read(|s| {
                let action = s
                    .plan
                    .milestone(milestone_id)
                    .map(|m| m.action_description());
                let latest = s
                    .approvals
                    .iter()
                    .rev()
                    .find(|r| r.subject.milestone_id() == Some(milestone_id))
                    .map(|r| (r.id.clone(), r.status));
                (action, latest)
            })
            .await;

        let action = action.ok_or_else(|| MarathonError::MilestoneNotFound(milestone_id.to_string()))?;
        let Some(assessment) = self.assess(&action) else {
            return Ok(GateDecision::Proceed);
        };

        match latest {
            Some((_, ApprovalStatus::Approved)) => Ok(GateDecision::Proceed),
            Some((request_id, ApprovalStatus::Pending)) => Ok(GateDecision::Wait { request_id }),
            _ => {
                let request = self
                    .request(
                        shared,
                        ApprovalSubject::milestone(milestone_id),
                        &action,
                        assessment,
                    )
                    .await;
                Ok(GateDecision::Wait {
                    request_id: request.id,
                })
            }
        }
    }

    /// Persist a new pending request, move the marathon to `waiting_human`
    /// and notify the configured channel.
    pub async fn request(
        &self,
        shared: &SharedState,
        subject: ApprovalSubject,
        description: &str,
        assessment: RiskAssessment,
    ) -> ApprovalRequest {
        let (after, auto) = self.policy.expiry();
        let expires_at = after
            .and_then(|d| chrono::Duration::from_std(d).ok())
            .map(|d| Utc::now() + d);

        let max_logs = shared.max_log_entries();
        let request = shared
            .update(|s| {
                let request = ApprovalRequest::new(
                    uuid::Uuid::new_v4().to_string(),
                    s.id.clone(),
                    subject,
                    description,
                    assessment.tier,
                    assessment.reasons,
                    expires_at,
                    auto,
                );
                s.approvals.push(request.clone());
                s.set_status(MarathonStatus::WaitingHuman);
                s.log(
                    LogLevel::Warn,
                    format!(
                        "approval required ({} risk): {} [request {}]",
                        request.tier, request.description, request.id
                    ),
                    max_logs,
                );
                request
            })
            .await;

        info!(
            marathon = %request.marathon_id,
            request = %request.id,
            tier = %request.tier,
            "approval requested"
        );
        self.events
            .emit(
                &request.marathon_id,
                MarathonEvent::ApprovalRequested {
                    request_id: request.id.clone(),
                    tier: request.tier,
                    description: request.description.clone(),
                },
            )
            .await;

        if let Some(channel) = self.policy.notify_channel().or(self.fallback_channel.as_deref()) {
            let message = format!(
                "Approval needed for marathon {} ({} risk): {}\nreasons: {}\napprove with: marathon approve {} {}",
                request.marathon_id,
                request.tier,
                request.description,
                request.reasons.join(", "),
                request.marathon_id,
                request.id,
            );
            notify_best_effort(self.notifier.as_ref(), channel, &message).await;
        }

        request
    }
}

/// Approve a pending request.
pub fn approve_request(
    state: &mut DurableMarathonState,
    request_id: &str,
    approver: &str,
    now: DateTime<Utc>,
) -> Result<ApprovalRequest> {
    let request = state
        .approval_mut(request_id)
        .ok_or_else(|| MarathonError::ApprovalNotFound(request_id.to_string()))?;
    request.approve(approver, now)?;
    Ok(request.clone())
}

/// Reject a pending request. The marathon pauses when its executor observes it.
pub fn reject_request(
    state: &mut DurableMarathonState,
    request_id: &str,
    approver: &str,
    reason: &str,
    now: DateTime<Utc>,
) -> Result<ApprovalRequest> {
    let request = state
        .approval_mut(request_id)
        .ok_or_else(|| MarathonError::ApprovalNotFound(request_id.to_string()))?;
    request.reject(approver, reason, now)?;
    Ok(request.clone())
}

/// Current outcome of `request_id`, applying auto-approval if it is due.
pub fn poll_request(
    state: &mut DurableMarathonState,
    request_id: &str,
    now: DateTime<Utc>,
) -> PollOutcome {
    let Some(request) = state.approval_mut(request_id) else {
        return PollOutcome::Missing;
    };

    if request.apply_auto_approval(now) {
        info!(request = %request_id, "approval auto-approved after deadline");
    }

    match request.status {
        ApprovalStatus::Pending => PollOutcome::Pending,
        ApprovalStatus::Approved => PollOutcome::Approved {
            by: request.resolved_by.clone().unwrap_or_default(),
        },
        ApprovalStatus::Rejected => PollOutcome::Rejected {
            reason: request
                .rejection_reason
                .clone()
                .unwrap_or_else(|| "rejected".to_string()),
        },
        ApprovalStatus::Expired => PollOutcome::Expired,
    }
}

/// Withdraw every pending request. Used when the marathon stops waiting.
pub fn expire_pending(state: &mut DurableMarathonState, now: DateTime<Utc>) -> usize {
    let mut expired = 0;
    for request in state.approvals.iter_mut().filter(|r| r.is_pending()) {
        match request.expire(now) {
            Ok(()) => expired += 1,
            Err(e) => warn!(request = %request.id, error = %e, "could not expire request"),
        }
    }
    expired
}
