// src/errors.rs

//! Crate-wide error type and helpers.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MarathonError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Marathon not found: {0}")]
    MarathonNotFound(String),

    #[error("Milestone not found: {0}")]
    MilestoneNotFound(String),

    #[error("Approval request not found: {0}")]
    ApprovalNotFound(String),

    #[error("Approval request {0} is already {1}")]
    ApprovalAlreadyResolved(String, String),

    /// Operator command does not fit the marathon's current state.
    #[error("Marathon {id} is {status}")]
    InvalidState { id: String, status: String },

    #[error("Cycle detected in milestone plan: {0}")]
    DagCycle(String),

    /// Any failure of the agent call itself. Consumes one retry.
    #[error("Agent call failed: {0}")]
    Agent(String),

    /// The milestone ran but did not verify. Consumes one retry.
    #[error("Verification failed: {0}")]
    Verification(String),

    /// Repetitive agent output for the same milestone.
    #[error("Loop detected while executing milestone '{0}'")]
    LoopDetected(String),

    #[error("Approval request {request_id} rejected: {reason}")]
    ApprovalRejected { request_id: String, reason: String },

    #[error("Marathon {0} exceeded its restart budget")]
    MaxRestartsExceeded(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl MarathonError {
    /// Errors that consume a milestone retry instead of aborting the marathon.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MarathonError::Agent(_)
                | MarathonError::Verification(_)
                | MarathonError::LoopDetected(_)
        )
    }
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, MarathonError>;
