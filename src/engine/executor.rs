// src/engine/executor.rs

//! Async shell around [`crate::engine::core`].
//!
//! One [`Executor`] drives one marathon: it asks the core what to do,
//! performs the agent calls and checks, and records every transition
//! through [`SharedState`]. All failures are absorbed into milestone
//! retries or the marathon status; nothing escapes the loop.

use std::time::Instant;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::agent::{AgentRequest, AgentResponse, ENGINE_CHANNEL, PromptContext, SessionKind};
use crate::approval::{ApprovalGate, GateDecision, PollOutcome, poll_request};
use crate::engine::context::EngineContext;
use crate::engine::core::{self, CoreStep, FailureStep, StopReason};
use crate::errors::{MarathonError, Result};
use crate::events::MarathonEvent;
use crate::heartbeat::HeartbeatEmitter;
use crate::loop_detector::{LoopDetector, LoopVerdict};
use crate::notify::notify_best_effort;
use crate::state::{
    ActionKind, CheckpointPayload, ControlRequest, DurableMarathonState, LogLevel, SharedState,
    truncate_text,
};
use crate::types::{CheckpointStatus, MarathonStatus};

/// Which kind of attempt is being made at a milestone.
#[derive(Debug, Clone)]
enum Attempt {
    Initial,
    Recovery { failure: String, attempt: u32 },
}

pub struct Executor {
    shared: SharedState,
    ctx: EngineContext,
    gate: ApprovalGate,
    loops: LoopDetector,
}

/// A running executor.
#[derive(Debug)]
pub struct ExecutorHandle {
    shared: SharedState,
    join: JoinHandle<MarathonStatus>,
}

impl ExecutorHandle {
    pub fn id(&self) -> &str {
        self.shared.id()
    }

    /// Live state of the marathon; writes through it reach the executor.
    pub fn shared(&self) -> &SharedState {
        &self.shared
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the executor to stop and return the status it stopped in.
    pub async fn wait(self) -> MarathonStatus {
        match self.join.await {
            Ok(status) => status,
            Err(e) => {
                error!(marathon = %self.shared.id(), error = %e, "executor task failed");
                self.shared.read(|s| s.status).await
            }
        }
    }
}

impl Executor {
    pub fn new(state: DurableMarathonState, ctx: EngineContext) -> Self {
        let shared = SharedState::new(state, ctx.store.clone(), ctx.settings.max_log_entries);
        let gate = ApprovalGate::new(
            ctx.policy.clone(),
            ctx.notifier.clone(),
            ctx.events.clone(),
            ctx.settings.notify_channel.clone(),
        );
        Self {
            shared,
            ctx,
            gate,
            loops: LoopDetector::default(),
        }
    }

    pub fn spawn(self) -> ExecutorHandle {
        let shared = self.shared.clone();
        let join = tokio::spawn(self.run());
        ExecutorHandle { shared, join }
    }

    /// Run to a stop: completion, failure, pause, or a rejected approval.
    ///
    /// The heartbeat is stopped and the state persisted on the way out,
    /// even if the loop itself panics.
    pub async fn run(self) -> MarathonStatus {
        let shared = self.shared.clone();
        let events = self.ctx.events.clone();
        let interval = self.ctx.settings.heartbeat_interval;
        let max_logs = self.ctx.settings.max_log_entries;
        let id = shared.id().to_string();

        let (goal, milestones) = shared
            .update(|s| {
                if s.status == MarathonStatus::Executing {
                    s.heartbeat.last_heartbeat = Utc::now();
                }
                s.log(LogLevel::Info, "executor started", max_logs);
                (s.plan.goal.clone(), s.plan.milestones.len())
            })
            .await;
        info!(marathon = %id, %goal, milestones, "executor started");
        events.emit(&id, MarathonEvent::Started { goal, milestones }).await;

        let heartbeat = HeartbeatEmitter::start(shared.clone(), interval, events.clone());
        let driver = tokio::spawn(self.drive());
        let outcome = driver.await;
        heartbeat.stop().await;

        if let Err(e) = &outcome {
            // The heartbeat is stopped and the status left as-is, so the
            // watchdog treats this like any other crash.
            error!(marathon = %id, error = %e, "executor loop aborted");
        }

        let (status, summary) = shared
            .update(|s| {
                s.log(LogLevel::Info, format!("executor stopped ({})", s.status), max_logs);
                (s.status, s.plan.progress_summary())
            })
            .await;
        info!(marathon = %id, %status, %summary, "executor stopped");
        if !status.is_active() {
            events
                .emit(&id, MarathonEvent::Finished { status, summary })
                .await;
        }
        status
    }

    async fn drive(mut self) -> MarathonStatus {
        loop {
            let step = self.shared.read(core::decide).await;
            match step {
                CoreStep::Stop(StopReason::Inactive(status)) => return status,
                CoreStep::Stop(StopReason::Control(request)) => {
                    return self.apply_control(request).await;
                }
                CoreStep::Finish(status) => return self.finish(status).await,
                CoreStep::AwaitApproval { request_id } => {
                    if let Some(status) = self.await_approval(&request_id).await {
                        return status;
                    }
                }
                CoreStep::Execute(milestone_id) => {
                    match self.gate.check_milestone(&self.shared, &milestone_id).await {
                        Ok(GateDecision::Proceed) => {
                            self.run_milestone(&milestone_id).await;
                            let delay = self.ctx.settings.milestone_delay;
                            if !delay.is_zero() {
                                tokio::time::sleep(delay).await;
                            }
                        }
                        // The pending request is picked up by the next decide.
                        Ok(GateDecision::Wait { .. }) => {}
                        Err(e) => {
                            error!(marathon = %self.shared.id(), error = %e, "approval gate failed");
                            return self.finish(MarathonStatus::Failed).await;
                        }
                    }
                }
            }
        }
    }

    fn max_logs(&self) -> usize {
        self.ctx.settings.max_log_entries
    }

    async fn notify(&self, message: String) {
        if let Some(channel) = &self.ctx.settings.notify_channel {
            notify_best_effort(self.ctx.notifier.as_ref(), channel, &message).await;
        }
    }

    async fn emit(&self, event: MarathonEvent) {
        self.ctx.events.emit(self.shared.id(), event).await;
    }

    /// Poll `request_id` until it resolves. Returns `Some(status)` when the
    /// executor must stop, `None` to continue the main loop.
    async fn await_approval(&self, request_id: &str) -> Option<MarathonStatus> {
        let max_logs = self.max_logs();
        info!(marathon = %self.shared.id(), request = %request_id, "waiting for approval");

        loop {
            let now = Utc::now();
            let (outcome, interrupted) = self
                .shared
                .update(|s| (poll_request(s, request_id, now), s.control.is_some()))
                .await;

            match outcome {
                PollOutcome::Pending => {
                    if interrupted {
                        return None;
                    }
                    tokio::time::sleep(self.ctx.settings.approval_poll_interval).await;
                }
                PollOutcome::Approved { by } => {
                    self.shared
                        .update(|s| {
                            s.log(
                                LogLevel::Info,
                                format!("approval {request_id} granted by {by}"),
                                max_logs,
                            );
                            if s.pending_approvals().next().is_none() {
                                s.set_status(MarathonStatus::Executing);
                            }
                        })
                        .await;
                    self.emit(MarathonEvent::ApprovalResolved {
                        request_id: request_id.to_string(),
                        approved: true,
                        by: Some(by),
                    })
                    .await;
                    return None;
                }
                PollOutcome::Rejected { reason } => {
                    let by = self
                        .shared
                        .update(|s| {
                            s.status = MarathonStatus::Paused;
                            s.log(
                                LogLevel::Warn,
                                format!("approval {request_id} rejected ({reason}); marathon paused"),
                                max_logs,
                            );
                            s.approval(request_id).and_then(|r| r.resolved_by.clone())
                        })
                        .await;
                    warn!(marathon = %self.shared.id(), request = %request_id, %reason, "approval rejected; pausing");
                    self.emit(MarathonEvent::ApprovalResolved {
                        request_id: request_id.to_string(),
                        approved: false,
                        by,
                    })
                    .await;
                    self.emit(MarathonEvent::StatusChanged {
                        status: MarathonStatus::Paused,
                    })
                    .await;
                    self.notify(format!(
                        "Marathon {} paused: approval {request_id} rejected ({reason})",
                        self.shared.id()
                    ))
                    .await;
                    return Some(MarathonStatus::Paused);
                }
                PollOutcome::Expired | PollOutcome::Missing => {
                    self.shared
                        .update(|s| {
                            if s.status == MarathonStatus::WaitingHuman
                                && s.pending_approvals().next().is_none()
                            {
                                s.set_status(MarathonStatus::Executing);
                            }
                        })
                        .await;
                    return None;
                }
            }
        }
    }

    async fn run_milestone(&mut self, id: &str) {
        let started = Instant::now();
        let max_logs = self.max_logs();
        let Some(title) = self
            .shared
            .update(|s| core::begin_milestone(s, id, max_logs))
            .await
        else {
            return;
        };
        info!(marathon = %self.shared.id(), milestone = %id, %title, "milestone started");
        self.emit(MarathonEvent::MilestoneStarted {
            milestone_id: id.to_string(),
            title: title.clone(),
        })
        .await;

        let mut attempt = Attempt::Initial;
        loop {
            match self.attempt(id, &attempt).await {
                Ok(()) => {
                    let elapsed_ms = started.elapsed().as_millis() as u64;
                    self.shared
                        .update(|s| core::complete_milestone(s, id, elapsed_ms, max_logs))
                        .await;
                    info!(marathon = %self.shared.id(), milestone = %id, elapsed_ms, "milestone completed");
                    self.emit(MarathonEvent::MilestoneCompleted {
                        milestone_id: id.to_string(),
                        elapsed_ms,
                    })
                    .await;
                    self.notify(format!("Milestone completed: {title}")).await;
                    return;
                }
                Err(err) => {
                    let error = err.to_string();
                    warn!(marathon = %self.shared.id(), milestone = %id, %error, "milestone attempt failed");
                    let retryable = err.is_retryable();
                    let step = self
                        .shared
                        .update(|s| core::record_failure(s, id, &error, retryable, max_logs))
                        .await;

                    match step {
                        FailureStep::Retry { attempt: n } => {
                            self.emit(MarathonEvent::MilestoneRetry {
                                milestone_id: id.to_string(),
                                attempt: n,
                                error: error.clone(),
                            })
                            .await;
                            attempt = Attempt::Recovery {
                                failure: error,
                                attempt: n,
                            };
                        }
                        FailureStep::Failed { skipped } => {
                            error!(marathon = %self.shared.id(), milestone = %id, %error, "milestone failed");
                            self.emit(MarathonEvent::MilestoneFailed {
                                milestone_id: id.to_string(),
                                error: error.clone(),
                                skipped,
                            })
                            .await;
                            self.notify(format!("Milestone failed: {title} ({error})")).await;
                            return;
                        }
                    }
                }
            }
        }
    }

    /// One execution (or recovery) pass followed by verification.
    async fn attempt(&mut self, id: &str, attempt: &Attempt) -> Result<()> {
        let prompts = self.ctx.prompts.clone();
        let built = self
            .shared
            .read(|s| {
                let milestone = s.plan.milestone(id)?;
                let (session, kind) = match attempt {
                    Attempt::Initial => (SessionKind::Execute, ActionKind::Execution),
                    Attempt::Recovery { failure, attempt } => (
                        SessionKind::Recover,
                        ActionKind::Recovery {
                            attempt: *attempt,
                            failure: truncate_text(failure, 500),
                        },
                    ),
                };
                let ctx = prompt_context(s, milestone, session);
                let prompt = match attempt {
                    Attempt::Initial => prompts.execution(&ctx),
                    Attempt::Recovery { failure, attempt } => {
                        prompts.recovery(&ctx, failure, *attempt)
                    }
                };
                Some((prompt, session, kind))
            })
            .await;
        let (prompt, session, kind) =
            built.ok_or_else(|| MarathonError::MilestoneNotFound(id.to_string()))?;

        let reply = self.call_agent(id, session, prompt, kind.into()).await?;

        if let LoopVerdict::Loop { occurrences } = self.loops.record(id, &reply.text) {
            self.correct_loop(id, occurrences, &reply.text).await;
            return Err(MarathonError::LoopDetected(id.to_string()));
        }

        self.shared
            .update(|s| {
                if let Some(milestone) = s.plan.milestone(id) {
                    s.context_summary = prompts.summarize(&s.context_summary, milestone, &reply.text);
                }
                if reply.continuity_token.is_some() {
                    s.continuity_token = reply.continuity_token.clone();
                }
            })
            .await;

        self.verify(id).await
    }

    /// Send one corrective prompt, then start the window afresh.
    async fn correct_loop(&mut self, id: &str, occurrences: usize, repeated: &str) {
        let max_logs = self.max_logs();
        warn!(marathon = %self.shared.id(), milestone = %id, occurrences, "loop detected");
        self.emit(MarathonEvent::LoopDetected {
            milestone_id: id.to_string(),
            occurrences,
        })
        .await;

        let prompts = self.ctx.prompts.clone();
        let prompt = self
            .shared
            .update(|s| {
                s.log(
                    LogLevel::Warn,
                    format!("loop detected in {id} ({occurrences} repeats); sending corrective prompt"),
                    max_logs,
                );
                let milestone = s.plan.milestone(id)?;
                let ctx = prompt_context(s, milestone, SessionKind::Corrective);
                Some(prompts.corrective(&ctx, repeated))
            })
            .await;

        if let Some(prompt) = prompt {
            let kind = ActionKind::Corrective {
                reason: format!("{occurrences} near-identical replies"),
            };
            if let Err(e) = self
                .call_agent(id, SessionKind::Corrective, prompt, kind.into())
                .await
            {
                warn!(milestone = %id, error = %e, "corrective prompt failed");
            }
        }
        self.loops.reset();
    }

    async fn verify(&self, id: &str) -> Result<()> {
        let prompts = self.ctx.prompts.clone();
        let (milestone, working_dir, prompt) = self
            .shared
            .read(|s| {
                let milestone = s.plan.milestone(id)?;
                let prompt = (!milestone.verification_steps.is_empty()).then(|| {
                    prompts.verification(&prompt_context(s, milestone, SessionKind::Verify))
                });
                Some((milestone.clone(), s.working_dir.clone(), prompt))
            })
            .await
            .ok_or_else(|| MarathonError::MilestoneNotFound(id.to_string()))?;

        if let Some(prompt) = prompt {
            let reply = self
                .call_agent(id, SessionKind::Verify, prompt, ActionKind::Verification.into())
                .await?;
            let verdict = prompts.parse_verdict(&reply.text);
            return if verdict.passed {
                Ok(())
            } else if verdict.reason.is_empty() {
                Err(MarathonError::Verification("verification did not pass".to_string()))
            } else {
                Err(MarathonError::Verification(verdict.reason))
            };
        }

        let missing: Vec<String> = milestone
            .artifacts
            .iter()
            .filter(|p| !self.ctx.fs.exists(&working_dir.join(p)))
            .map(|p| p.display().to_string())
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(MarathonError::Verification(format!(
                "missing artifacts: {}",
                missing.join(", ")
            )))
        }
    }

    /// Checkpoint, call the agent, record the outcome on the checkpoint.
    async fn call_agent(
        &self,
        id: &str,
        session: SessionKind,
        prompt: String,
        payload: CheckpointPayload,
    ) -> Result<AgentResponse> {
        let max_logs = self.max_logs();
        let (action_index, continuity_token) = self
            .shared
            .update(|s| {
                let index = s.begin_checkpoint(id, payload, &prompt);
                s.log(LogLevel::Info, format!("{session} {id} (action {index})"), max_logs);
                (index, s.continuity_token.clone())
            })
            .await;

        let request = AgentRequest {
            prompt,
            peer_id: self.shared.id().to_string(),
            channel: ENGINE_CHANNEL.to_string(),
            session,
            milestone_id: id.to_string(),
            continuity_token,
        };
        let result = self.ctx.agent.chat(request).await.map_err(|e| {
            if e.is_retryable() {
                e
            } else {
                MarathonError::Agent(e.to_string())
            }
        });

        self.shared
            .update(|s| match &result {
                Ok(reply) => s.finish_checkpoint(action_index, &reply.text, CheckpointStatus::Completed),
                Err(e) => s.finish_checkpoint(action_index, &e.to_string(), CheckpointStatus::Failed),
            })
            .await;
        result
    }

    async fn apply_control(&self, request: ControlRequest) -> MarathonStatus {
        let max_logs = self.max_logs();
        let status = self
            .shared
            .update(|s| core::apply_control(s, &request, max_logs))
            .await;
        info!(marathon = %self.shared.id(), action = ?request.action, %status, "control request applied");
        self.emit(MarathonEvent::StatusChanged { status }).await;
        self.notify(format!("Marathon {} is now {status}", self.shared.id()))
            .await;
        status
    }

    async fn finish(&self, status: MarathonStatus) -> MarathonStatus {
        let max_logs = self.max_logs();
        let summary = self
            .shared
            .update(|s| core::finish(s, status, max_logs))
            .await;
        info!(marathon = %self.shared.id(), %status, %summary, "marathon finished");
        self.emit(MarathonEvent::StatusChanged { status }).await;
        self.notify(format!("Marathon {} {status}: {summary}", self.shared.id()))
            .await;
        status
    }
}

fn prompt_context<'a>(
    state: &'a DurableMarathonState,
    milestone: &'a crate::plan::Milestone,
    session: SessionKind,
) -> PromptContext<'a> {
    let key = session.to_string();
    PromptContext {
        goal: &state.plan.goal,
        milestone,
        context_summary: &state.context_summary,
        thinking: state
            .plan
            .thinking
            .get(key.as_str())
            .or_else(|| state.plan.thinking.get("default"))
            .map(String::as_str),
    }
}
