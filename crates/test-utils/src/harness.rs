use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use marathon::approval::ApprovalPolicy;
use marathon::config::{ApprovalSettings, EngineSettings, WatchdogSettings};
use marathon::engine::{EngineContext, Executor, ExecutorHandle, start_marathon};
use marathon::events::{EventSubscriber, MarathonEvent, bounded};
use marathon::plan::MarathonPlan;
use marathon::state::{DurableMarathonState, FileStateStore, StateStore};
use marathon::types::BackpressurePolicy;
use marathon::watchdog::Watchdog;

use crate::agent::ScriptedAgent;
use crate::builders::fast_engine_settings;
use crate::notifier::RecordingNotifier;

/// An engine wired to fakes: scripted agent, recording notifier, a real
/// file store in a temp dir, and a large drop-oldest event channel.
pub struct TestEngine {
    pub ctx: EngineContext,
    pub agent: Arc<ScriptedAgent>,
    pub notifier: Arc<RecordingNotifier>,
    pub store: Arc<FileStateStore>,
    pub events: EventSubscriber,
    pub dir: TempDir,
}

impl TestEngine {
    pub fn new() -> Self {
        Self::build(fast_engine_settings(), None)
    }

    /// Engine whose approval policy is compiled from `approval`.
    pub fn with_approval(approval: ApprovalSettings) -> Self {
        Self::build(fast_engine_settings(), Some(approval))
    }

    /// `approval = None` means a policy that never asks.
    pub fn build(settings: EngineSettings, approval: Option<ApprovalSettings>) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(FileStateStore::open(dir.path().join("state")));
        let agent = Arc::new(ScriptedAgent::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let policy = match approval {
            Some(a) => ApprovalPolicy::compile(&a).expect("valid approval settings"),
            None => ApprovalPolicy::permissive(),
        };
        let (publisher, events) = bounded(4096, BackpressurePolicy::DropOldest, Duration::ZERO);

        std::fs::create_dir_all(dir.path().join("work")).expect("workdir");
        let ctx = EngineContext::new(
            agent.clone(),
            store.clone() as Arc<dyn StateStore>,
            publisher,
            settings,
            policy,
        )
        .with_notifier(notifier.clone());

        Self {
            ctx,
            agent,
            notifier,
            store,
            events,
            dir,
        }
    }

    pub fn workdir(&self) -> PathBuf {
        self.dir.path().join("work")
    }

    pub fn start(&self, plan: MarathonPlan) -> DurableMarathonState {
        start_marathon(&self.ctx, plan, self.workdir()).expect("start marathon")
    }

    pub fn spawn(&self, plan: MarathonPlan) -> ExecutorHandle {
        Executor::new(self.start(plan), self.ctx.clone()).spawn()
    }

    pub fn load(&self, id: &str) -> DurableMarathonState {
        self.store.load_existing(id).expect("load state")
    }

    pub fn watchdog(&self, settings: WatchdogSettings) -> Watchdog {
        Watchdog::new(self.ctx.clone(), settings)
    }

    /// Everything published so far, heartbeats excluded.
    pub fn drain_events(&mut self) -> Vec<MarathonEvent> {
        let mut out = Vec::new();
        while let Some(envelope) = self.events.try_recv() {
            if !envelope.event.is_heartbeat() {
                out.push(envelope.event);
            }
        }
        out
    }
}

impl Default for TestEngine {
    fn default() -> Self {
        Self::new()
    }
}
