// src/engine/context.rs

use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;

use crate::agent::{Agent, DefaultPrompts, PromptStrategy};
use crate::approval::ApprovalPolicy;
use crate::config::EngineSettings;
use crate::errors::Result;
use crate::events::EventPublisher;
use crate::fs::{FileSystem, RealFileSystem};
use crate::notify::{Notifier, TracingNotifier};
use crate::plan::{MarathonPlan, validate_plan};
use crate::state::{DurableMarathonState, LogLevel, StateStore};

/// Everything an executor needs besides the marathon itself. Cheap to clone;
/// the watchdog hands a copy to every executor it (re)starts.
#[derive(Clone)]
pub struct EngineContext {
    pub agent: Arc<dyn Agent>,
    pub store: Arc<dyn StateStore>,
    pub events: EventPublisher,
    pub settings: EngineSettings,
    pub policy: Arc<ApprovalPolicy>,
    pub notifier: Arc<dyn Notifier>,
    pub prompts: Arc<dyn PromptStrategy>,
    /// Used to check milestone artifacts.
    pub fs: Arc<dyn FileSystem>,
}

impl EngineContext {
    pub fn new(
        agent: Arc<dyn Agent>,
        store: Arc<dyn StateStore>,
        events: EventPublisher,
        settings: EngineSettings,
        policy: ApprovalPolicy,
    ) -> Self {
        Self {
            agent,
            store,
            events,
            settings,
            policy: Arc::new(policy),
            notifier: Arc::new(TracingNotifier),
            prompts: Arc::new(DefaultPrompts),
            fs: Arc::new(RealFileSystem),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_prompts(mut self, prompts: Arc<dyn PromptStrategy>) -> Self {
        self.prompts = prompts;
        self
    }

    pub fn with_fs(mut self, fs: Arc<dyn FileSystem>) -> Self {
        self.fs = fs;
        self
    }
}

/// Validate `plan`, create the durable state for a new marathon and persist
/// it. The caller decides whether and where to run it.
pub fn start_marathon(
    ctx: &EngineContext,
    plan: MarathonPlan,
    working_dir: impl Into<PathBuf>,
) -> Result<DurableMarathonState> {
    validate_plan(&plan)?;

    let id = uuid::Uuid::new_v4().to_string();
    let mut state = DurableMarathonState::new(id, plan, working_dir, &ctx.settings);
    state.log(
        LogLevel::Info,
        format!(
            "marathon created: {} ({} milestones)",
            state.plan.goal,
            state.plan.milestones.len()
        ),
        ctx.settings.max_log_entries,
    );
    ctx.store.save(&state)?;

    info!(marathon = %state.id, goal = %state.plan.goal, "marathon created");
    Ok(state)
}
