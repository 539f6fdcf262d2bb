// src/approval/mod.rs

//! Human approval for risky actions.
//!
//! - [`policy`] classifies an action description into a risk tier.
//! - [`request`] is the persisted request and its one-way resolution.
//! - [`gate`] raises requests for milestones and resolves them.

pub mod gate;
pub mod policy;
pub mod request;

pub use gate::{
    ApprovalGate, GateDecision, PollOutcome, approve_request, expire_pending, poll_request,
    reject_request,
};
pub use policy::{ApprovalPolicy, RiskAssessment};
pub use request::{AUTO_APPROVER, ApprovalRequest, ApprovalSubject, ApprovalTarget};
