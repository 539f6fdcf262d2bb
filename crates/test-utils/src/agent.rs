use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;

use marathon::agent::{Agent, AgentRequest, AgentResponse, SessionKind};
use marathon::errors::{MarathonError, Result};

#[derive(Debug, Clone)]
enum Reply {
    Text(String),
    WithToken { text: String, token: String },
    Fail(String),
    Hang,
    Panic,
}

/// A fake agent that:
/// - records every request it receives
/// - answers from per-(milestone, session) queues scripted by the test
/// - falls back to a reply that lets the milestone pass when a queue is empty
///
/// Default replies: execute → "finished <id>", recover → a different
/// sentence per attempt, verify → `{"passed": true}`.
#[derive(Debug, Default)]
pub struct ScriptedAgent {
    script: Mutex<HashMap<(String, SessionKind), VecDeque<Reply>>>,
    requests: Mutex<Vec<AgentRequest>>,
}

impl ScriptedAgent {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, milestone: &str, session: SessionKind, reply: Reply) -> &Self {
        self.script
            .lock()
            .unwrap()
            .entry((milestone.to_string(), session))
            .or_default()
            .push_back(reply);
        self
    }

    pub fn reply(&self, milestone: &str, session: SessionKind, text: &str) -> &Self {
        self.push(milestone, session, Reply::Text(text.to_string()))
    }

    /// Queue a reply that hands back a continuity token for the next call.
    pub fn reply_with_token(
        &self,
        milestone: &str,
        session: SessionKind,
        text: &str,
        token: &str,
    ) -> &Self {
        self.push(
            milestone,
            session,
            Reply::WithToken {
                text: text.to_string(),
                token: token.to_string(),
            },
        )
    }

    /// Queue the same reply `n` times.
    pub fn reply_n(&self, milestone: &str, session: SessionKind, text: &str, n: usize) -> &Self {
        for _ in 0..n {
            self.reply(milestone, session, text);
        }
        self
    }

    /// Queue a retryable agent error.
    pub fn fail(&self, milestone: &str, session: SessionKind, error: &str) -> &Self {
        self.push(milestone, session, Reply::Fail(error.to_string()))
    }

    /// Queue a call that never returns.
    pub fn hang(&self, milestone: &str, session: SessionKind) -> &Self {
        self.push(milestone, session, Reply::Hang)
    }

    /// Queue a call that panics, taking the executor loop down with it.
    pub fn panic_on(&self, milestone: &str, session: SessionKind) -> &Self {
        self.push(milestone, session, Reply::Panic)
    }

    pub fn requests(&self) -> Vec<AgentRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn calls(&self, milestone: &str, session: SessionKind) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.milestone_id == milestone && r.session == session)
            .count()
    }

    /// Milestones in the order their first execute request arrived.
    pub fn execution_order(&self) -> Vec<String> {
        let mut order = Vec::new();
        for r in self.requests.lock().unwrap().iter() {
            if r.session == SessionKind::Execute && !order.contains(&r.milestone_id) {
                order.push(r.milestone_id.clone());
            }
        }
        order
    }

    fn next_reply(&self, request: &AgentRequest) -> Reply {
        let key = (request.milestone_id.clone(), request.session);
        if let Some(reply) = self
            .script
            .lock()
            .unwrap()
            .get_mut(&key)
            .and_then(VecDeque::pop_front)
        {
            return reply;
        }

        let id = &request.milestone_id;
        let text = match request.session {
            SessionKind::Execute => format!("finished {id}"),
            SessionKind::Recover => {
                let n = self.calls(id, SessionKind::Recover);
                let route = (b'a' + (n % 26) as u8) as char;
                format!("recovered {id} via route {route}")
            }
            SessionKind::Verify => r#"{"passed": true}"#.to_string(),
            SessionKind::Corrective => format!("switching approach for {id}"),
        };
        Reply::Text(text)
    }
}

impl Agent for ScriptedAgent {
    fn chat(
        &self,
        request: AgentRequest,
    ) -> Pin<Box<dyn Future<Output = Result<AgentResponse>> + Send + '_>> {
        Box::pin(async move {
            self.requests.lock().unwrap().push(request.clone());
            match self.next_reply(&request) {
                Reply::Text(text) => Ok(AgentResponse::text(text)),
                Reply::WithToken { text, token } => Ok(AgentResponse {
                    text,
                    continuity_token: Some(token),
                }),
                Reply::Fail(error) => Err(MarathonError::Agent(error)),
                Reply::Hang => std::future::pending().await,
                Reply::Panic => panic!("scripted agent panic in {}", request.milestone_id),
            }
        })
    }
}
