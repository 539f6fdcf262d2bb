// src/approval/request.rs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{MarathonError, Result};
use crate::types::{ApprovalStatus, RiskTier};

/// Approver name recorded when a request resolves itself on expiry.
pub const AUTO_APPROVER: &str = "auto-approve";

/// What an approval request gates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ApprovalTarget {
    /// Starting a milestone.
    Milestone { milestone_id: String },
    /// A free-form action description.
    Action { description: String },
}

/// Known targets, or anything a newer writer stored, kept verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ApprovalSubject {
    Known(ApprovalTarget),
    Opaque(serde_json::Value),
}

impl ApprovalSubject {
    pub fn milestone(id: impl Into<String>) -> Self {
        ApprovalSubject::Known(ApprovalTarget::Milestone {
            milestone_id: id.into(),
        })
    }

    pub fn milestone_id(&self) -> Option<&str> {
        match self {
            ApprovalSubject::Known(ApprovalTarget::Milestone { milestone_id }) => {
                Some(milestone_id)
            }
            _ => None,
        }
    }
}

/// A pending or resolved request for human sign-off.
///
/// Resolution is one-way: once `approved`, `rejected` or `expired` the
/// request never changes again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: String,
    pub marathon_id: String,
    pub subject: ApprovalSubject,
    pub description: String,
    pub tier: RiskTier,
    #[serde(default)]
    pub reasons: Vec<String>,
    pub status: ApprovalStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    /// Approve automatically once `expires_at` passes; otherwise the request
    /// keeps blocking past expiry.
    #[serde(default)]
    pub auto_approve_on_expiry: bool,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub resolved_by: Option<String>,
    #[serde(default)]
    pub rejection_reason: Option<String>,
}

impl ApprovalRequest {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: impl Into<String>,
        marathon_id: impl Into<String>,
        subject: ApprovalSubject,
        description: impl Into<String>,
        tier: RiskTier,
        reasons: Vec<String>,
        expires_at: Option<DateTime<Utc>>,
        auto_approve_on_expiry: bool,
    ) -> Self {
        Self {
            id: id.into(),
            marathon_id: marathon_id.into(),
            subject,
            description: description.into(),
            tier,
            reasons,
            status: ApprovalStatus::Pending,
            created_at: Utc::now(),
            expires_at,
            auto_approve_on_expiry,
            resolved_at: None,
            resolved_by: None,
            rejection_reason: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == ApprovalStatus::Pending
    }

    pub fn is_past_expiry(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }

    pub fn approve(&mut self, by: &str, now: DateTime<Utc>) -> Result<()> {
        self.resolve(ApprovalStatus::Approved, Some(by), None, now)
    }

    pub fn reject(&mut self, by: &str, reason: &str, now: DateTime<Utc>) -> Result<()> {
        self.resolve(ApprovalStatus::Rejected, Some(by), Some(reason), now)
    }

    /// Withdraw the request because its marathon stopped waiting for it.
    pub fn expire(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.resolve(ApprovalStatus::Expired, None, None, now)
    }

    /// Apply auto-approval if due. Returns true exactly once, on the call
    /// that performed the transition.
    pub fn apply_auto_approval(&mut self, now: DateTime<Utc>) -> bool {
        if self.is_pending() && self.auto_approve_on_expiry && self.is_past_expiry(now) {
            return self.approve(AUTO_APPROVER, now).is_ok();
        }
        false
    }

    fn resolve(
        &mut self,
        status: ApprovalStatus,
        by: Option<&str>,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if !self.is_pending() {
            return Err(MarathonError::ApprovalAlreadyResolved(
                self.id.clone(),
                self.status.to_string(),
            ));
        }
        self.status = status;
        self.resolved_at = Some(now);
        self.resolved_by = by.map(str::to_string);
        self.rejection_reason = reason.map(str::to_string);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn request(expires_in: Option<i64>, auto: bool) -> ApprovalRequest {
        ApprovalRequest::new(
            "r1",
            "m1",
            ApprovalSubject::milestone("deploy"),
            "deploy to prod",
            RiskTier::High,
            vec!["flagged command".into()],
            expires_in.map(|s| Utc::now() + Duration::seconds(s)),
            auto,
        )
    }

    #[test]
    fn resolution_is_one_way() {
        let mut r = request(None, false);
        r.approve("alice", Utc::now()).unwrap();

        let err = r.reject("bob", "too late", Utc::now()).unwrap_err();
        assert!(matches!(err, MarathonError::ApprovalAlreadyResolved(_, s) if s == "approved"));
        assert!(r.expire(Utc::now()).is_err());
        assert_eq!(r.status, ApprovalStatus::Approved);
        assert_eq!(r.resolved_by.as_deref(), Some("alice"));
    }

    #[test]
    fn auto_approval_happens_exactly_once() {
        let mut r = request(Some(-1), true);
        assert!(r.apply_auto_approval(Utc::now()));
        assert!(!r.apply_auto_approval(Utc::now()));
        assert_eq!(r.resolved_by.as_deref(), Some(AUTO_APPROVER));
    }

    #[test]
    fn expiry_without_auto_approval_keeps_blocking() {
        let mut r = request(Some(-1), false);
        assert!(r.is_past_expiry(Utc::now()));
        assert!(!r.apply_auto_approval(Utc::now()));
        assert!(r.is_pending());
    }

    #[test]
    fn auto_approval_waits_for_deadline() {
        let mut r = request(Some(3600), true);
        assert!(!r.apply_auto_approval(Utc::now()));
        assert!(r.is_pending());
    }

    #[test]
    fn subject_keeps_unknown_shapes() {
        let subject: ApprovalSubject =
            serde_json::from_str(r#"{"kind":"payment","amount":12}"#).unwrap();
        assert!(matches!(subject, ApprovalSubject::Opaque(_)));
        assert_eq!(subject.milestone_id(), None);
        assert_eq!(ApprovalSubject::milestone("x").milestone_id(), Some("x"));
    }
}
