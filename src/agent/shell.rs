// src/agent/shell.rs

//! Agent backed by an external command.
//!
//! The command runs through the platform shell once per request. The prompt
//! is written to its stdin; its stdout is the reply. A stdout line of the
//! form `CONTINUITY: <token>` is stripped from the reply and returned as the
//! continuity token for the next request.

use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, anyhow};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info};

use crate::agent::{Agent, AgentRequest, AgentResponse};
use crate::errors::{MarathonError, Result};

const CONTINUITY_PREFIX: &str = "CONTINUITY:";

#[derive(Debug, Clone)]
pub struct ShellAgent {
    cmd: String,
    timeout: Duration,
}

impl ShellAgent {
    pub fn new(cmd: impl Into<String>, timeout: Duration) -> Self {
        Self {
            cmd: cmd.into(),
            timeout,
        }
    }

    async fn run(&self, request: AgentRequest) -> anyhow::Result<AgentResponse> {
        info!(
            marathon = %request.peer_id,
            milestone = %request.milestone_id,
            session = %request.session,
            cmd = %self.cmd,
            "invoking agent command"
        );

        let mut cmd = if cfg!(windows) {
            let mut c = Command::new("cmd");
            c.arg("/C").arg(&self.cmd);
            c
        } else {
            let mut c = Command::new("sh");
            c.arg("-c").arg(&self.cmd);
            c
        };

        cmd.env("MARATHON_ID", &request.peer_id)
            .env("MARATHON_CHANNEL", &request.channel)
            .env("MARATHON_SESSION", request.session.to_string())
            .env("MARATHON_MILESTONE", &request.milestone_id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(token) = &request.continuity_token {
            cmd.env("MARATHON_CONTINUITY", token);
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawning agent command '{}'", self.cmd))?;

        if let Some(mut stdin) = child.stdin.take() {
            let prompt = request.prompt.clone();
            // Writing in the background keeps a command that never reads
            // stdin from deadlocking on a full pipe.
            tokio::spawn(async move {
                let _ = stdin.write_all(prompt.as_bytes()).await;
                let _ = stdin.shutdown().await;
            });
        }

        // Always consume stderr so buffers don't fill; log at debug.
        if let Some(stderr) = child.stderr.take() {
            let milestone = request.milestone_id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(milestone = %milestone, "agent stderr: {}", line);
                }
            });
        }

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("agent stdout not captured"))?;

        let output = async {
            let mut buf = String::new();
            stdout.read_to_string(&mut buf).await?;
            let status = child.wait().await?;
            anyhow::Ok((buf, status))
        };

        let (raw, status) = tokio::time::timeout(self.timeout, output)
            .await
            .map_err(|_| anyhow!("agent command timed out after {:?}", self.timeout))??;

        if !status.success() {
            return Err(anyhow!(
                "agent command exited with code {}",
                status.code().unwrap_or(-1)
            ));
        }

        Ok(split_continuity(&raw))
    }
}

impl Agent for ShellAgent {
    fn chat(
        &self,
        request: AgentRequest,
    ) -> Pin<Box<dyn Future<Output = Result<AgentResponse>> + Send + '_>> {
        Box::pin(async move {
            self.run(request)
                .await
                .map_err(|e| MarathonError::Agent(format!("{e:#}")))
        })
    }
}

/// Separate `CONTINUITY:` lines from the reply text. The last one wins.
fn split_continuity(raw: &str) -> AgentResponse {
    let mut token = None;
    let mut text_lines = Vec::new();
    for line in raw.lines() {
        match line.trim().strip_prefix(CONTINUITY_PREFIX) {
            Some(rest) if !rest.trim().is_empty() => token = Some(rest.trim().to_string()),
            _ => text_lines.push(line),
        }
    }
    AgentResponse {
        text: text_lines.join("\n").trim().to_string(),
        continuity_token: token,
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::agent::SessionKind;

    fn request(prompt: &str) -> AgentRequest {
        AgentRequest {
            prompt: prompt.to_string(),
            peer_id: "m-1".to_string(),
            channel: "marathon".to_string(),
            session: SessionKind::Execute,
            milestone_id: "a".to_string(),
            continuity_token: Some("prev".to_string()),
        }
    }

    #[tokio::test]
    async fn prompt_goes_in_on_stdin() {
        let agent = ShellAgent::new("cat", Duration::from_secs(5));
        let reply = agent.chat(request("build the parser")).await.unwrap();
        assert_eq!(reply.text, "build the parser");
        assert_eq!(reply.continuity_token, None);
    }

    #[tokio::test]
    async fn continuity_line_is_extracted_and_env_is_set() {
        let agent = ShellAgent::new(
            "echo \"done $MARATHON_MILESTONE after $MARATHON_CONTINUITY\"; echo 'CONTINUITY: abc123'",
            Duration::from_secs(5),
        );
        let reply = agent.chat(request("")).await.unwrap();
        assert_eq!(reply.text, "done a after prev");
        assert_eq!(reply.continuity_token.as_deref(), Some("abc123"));
    }

    #[tokio::test]
    async fn non_zero_exit_is_an_agent_error() {
        let agent = ShellAgent::new("echo partial; exit 3", Duration::from_secs(5));
        let err = agent.chat(request("x")).await.unwrap_err();
        assert!(matches!(err, MarathonError::Agent(msg) if msg.contains("code 3")));
    }

    #[tokio::test]
    async fn slow_command_times_out() {
        let agent = ShellAgent::new("sleep 5", Duration::from_millis(100));
        let err = agent.chat(request("x")).await.unwrap_err();
        assert!(matches!(err, MarathonError::Agent(msg) if msg.contains("timed out")));
    }
}
