// src/agent/mod.rs

//! The agent seam: whatever actually performs milestone work.
//!
//! The engine never talks to a model or tool directly; it sends prompts
//! through [`Agent::chat`] and interprets the text that comes back.

pub mod prompts;
pub mod shell;

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

use crate::errors::Result;

pub use prompts::{DefaultPrompts, PromptContext, PromptStrategy, Verdict, parse_verdict};
pub use shell::ShellAgent;

/// Channel name the engine uses for all of its own agent traffic.
pub const ENGINE_CHANNEL: &str = "marathon";

/// Which phase of milestone work a request belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    Execute,
    Verify,
    Recover,
    Corrective,
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionKind::Execute => "execute",
            SessionKind::Verify => "verify",
            SessionKind::Recover => "recover",
            SessionKind::Corrective => "corrective",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentRequest {
    pub prompt: String,
    /// Marathon id; lets the agent keep per-marathon conversation state.
    pub peer_id: String,
    pub channel: String,
    pub session: SessionKind,
    pub milestone_id: String,
    /// Opaque token returned by the previous reply, if any.
    pub continuity_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AgentResponse {
    pub text: String,
    pub continuity_token: Option<String>,
}

impl AgentResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            continuity_token: None,
        }
    }
}

/// Performs one unit of work per call. Any error consumes a milestone retry.
pub trait Agent: Send + Sync {
    fn chat(
        &self,
        request: AgentRequest,
    ) -> Pin<Box<dyn Future<Output = Result<AgentResponse>> + Send + '_>>;
}
