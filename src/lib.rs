// src/lib.rs

pub mod agent;
pub mod approval;
pub mod cli;
pub mod config;
pub mod engine;
pub mod errors;
pub mod events;
pub mod fs;
pub mod heartbeat;
pub mod logging;
pub mod loop_detector;
pub mod notify;
pub mod plan;
pub mod state;
pub mod types;
pub mod watchdog;

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::agent::{Agent, AgentRequest, AgentResponse, ShellAgent};
use crate::approval::ApprovalPolicy;
use crate::cli::{CliArgs, Command};
use crate::config::{Settings, format_duration, load_settings};
use crate::engine::{EngineContext, Executor, start_marathon};
use crate::errors::MarathonError;
use crate::events::{ConsoleSink, EventSink, JsonLinesSink, bounded, spawn_event_pump};
use crate::plan::load_plan;
use crate::state::{FileStateStore, StateStore};
use crate::types::MarathonStatus;
use crate::watchdog::{MarathonReport, PendingApproval, Watchdog};

/// How long to let the event pump drain after a command finishes.
const PUMP_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - settings loading
/// - state store, agent, approval policy
/// - event channel + sinks
/// - the watchdog service, through which every subcommand acts
pub async fn run(args: CliArgs) -> Result<()> {
    let settings = load_settings(&args.config)
        .with_context(|| format!("loading settings from {}", args.config.display()))?;

    let verbose = match &args.command {
        Command::Start { verbose, .. }
        | Command::Watch { verbose }
        | Command::Restart { verbose, .. } => *verbose,
        _ => false,
    };
    let runs_executors = matches!(
        args.command,
        Command::Start { .. } | Command::Watch { .. } | Command::Restart { .. }
    );
    if runs_executors && settings.agent.cmd.is_none() {
        anyhow::bail!("no agent configured: set `cmd` in the [agent] section of the settings file");
    }

    let (watchdog, pump) = build(&settings, verbose)?;
    let outcome = dispatch(&watchdog, args.command).await;

    // Executors still running (watch mode) keep publishers alive; don't
    // wait on them forever.
    drop(watchdog);
    match tokio::time::timeout(PUMP_DRAIN_TIMEOUT, pump).await {
        Ok(Ok(handled)) => debug!(handled, "event pump drained"),
        Ok(Err(e)) => warn!(error = %e, "event pump task failed"),
        Err(_) => debug!("event pump still busy at exit"),
    }
    outcome
}

fn build(settings: &Settings, verbose: bool) -> Result<(Watchdog, JoinHandle<u64>)> {
    let store: Arc<dyn StateStore> = Arc::new(FileStateStore::open(&settings.storage.state_dir));
    let agent: Arc<dyn Agent> = match &settings.agent.cmd {
        Some(cmd) => Arc::new(ShellAgent::new(cmd.clone(), settings.agent.timeout)),
        None => Arc::new(UnconfiguredAgent),
    };
    let policy = ApprovalPolicy::compile(&settings.approval)?;

    let (events, subscriber) = bounded(
        settings.events.capacity,
        settings.events.backpressure,
        settings.events.heartbeat_throttle,
    );
    let mut sinks: Vec<Box<dyn EventSink>> = vec![Box::new(ConsoleSink { verbose })];
    if let Some(path) = &settings.events.log_file {
        sinks.push(Box::new(JsonLinesSink::open(path)?));
    }
    let pump = spawn_event_pump(subscriber, sinks);

    let ctx = EngineContext::new(agent, store, events, settings.engine.clone(), policy);
    Ok((Watchdog::new(ctx, settings.watchdog.clone()), pump))
}

async fn dispatch(watchdog: &Watchdog, command: Command) -> Result<()> {
    match command {
        Command::Start { plan, workdir, .. } => {
            let plan = load_plan(&plan)?;
            let workdir = resolve_workdir(workdir).context("resolving working directory")?;
            let ctx = watchdog.context();
            let state = start_marathon(ctx, plan, workdir)?;
            println!("marathon {} started: {}", state.id, state.plan.goal);

            let handle = Executor::new(state, ctx.clone()).spawn();
            let id = handle.id().to_string();
            watchdog.track(handle).await;
            report_final(&id, run_foreground(watchdog, &id).await?);
        }
        Command::Watch { .. } => {
            watchdog
                .run(async {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        warn!(error = %e, "failed to listen for Ctrl+C");
                        std::future::pending::<()>().await;
                    }
                })
                .await;
        }
        Command::Status { id, json } => {
            let reports = watchdog.status(id.as_deref()).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&reports)?);
            } else {
                print_reports(&reports);
            }
        }
        Command::Approvals { json } => {
            let pending = watchdog.pending_approvals().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&pending)?);
            } else {
                print_approvals(&pending);
            }
        }
        Command::Approve {
            marathon,
            request,
            by,
        } => {
            let resolved = watchdog.approve(&marathon, &request, by.as_deref()).await?;
            println!("approved {} ({})", resolved.id, resolved.description);
        }
        Command::Reject {
            marathon,
            request,
            reason,
            by,
        } => {
            let resolved = watchdog
                .reject(&marathon, &request, by.as_deref(), &reason)
                .await?;
            println!("rejected {}; marathon {marathon} will pause", resolved.id);
        }
        Command::Pause { id } => {
            watchdog.pause(&id).await?;
            println!("pause requested for {id}");
        }
        Command::Abort { id } => {
            watchdog.abort(&id).await?;
            println!("abort requested for {id}");
        }
        Command::Restart { id, .. } => {
            watchdog.restart(&id).await?;
            println!("marathon {id} restarted");
            report_final(&id, run_foreground(watchdog, &id).await?);
        }
    }
    Ok(())
}

/// Wait for a live marathon. The first Ctrl-C pauses it and keeps waiting;
/// a second one leaves without waiting.
async fn run_foreground(watchdog: &Watchdog, id: &str) -> Result<Option<MarathonStatus>> {
    let join = watchdog.join(id);
    tokio::pin!(join);

    tokio::select! {
        status = &mut join => return Ok(status),
        signal = tokio::signal::ctrl_c() => signal.context("listening for Ctrl+C")?,
    }

    println!("pausing {id} (Ctrl-C again to exit without waiting)");
    if let Err(e) = watchdog.pause(id).await {
        warn!(marathon = %id, error = %e, "pause failed");
    }
    tokio::select! {
        status = &mut join => Ok(status),
        _ = tokio::signal::ctrl_c() => {
            info!(marathon = %id, "exiting without waiting for the executor");
            Ok(None)
        }
    }
}

fn report_final(id: &str, status: Option<MarathonStatus>) {
    match status {
        Some(status) => println!("marathon {id} {status}"),
        None => println!("marathon {id} left running; `marathon watch` will pick it up"),
    }
}

fn print_reports(reports: &[MarathonReport]) {
    if reports.is_empty() {
        println!("no marathons");
        return;
    }
    println!(
        "{:<36}  {:<13}  {:<24}  {:>9}  {:>8}  GOAL",
        "ID", "STATUS", "PROGRESS", "HEARTBEAT", "RESTARTS"
    );
    for r in reports {
        let age = format_duration(Duration::from_millis(r.heartbeat_age_ms));
        println!(
            "{:<36}  {:<13}  {:<24}  {:>9}  {:>8}  {}",
            r.id,
            r.display.to_string(),
            r.progress,
            age,
            format!("{}/{}", r.restarts, r.crash_count),
            r.goal
        );
        if let Some(action) = &r.last_action {
            println!("    last: {action}");
        }
    }
}

fn print_approvals(pending: &[PendingApproval]) {
    if pending.is_empty() {
        println!("no pending approvals");
        return;
    }
    for p in pending {
        let overdue = if p.overdue { " (overdue)" } else { "" };
        println!(
            "{}  {}  [{}]{}  {}",
            p.marathon_id, p.request.id, p.request.tier, overdue, p.request.description
        );
        for reason in &p.request.reasons {
            println!("    - {reason}");
        }
    }
}

/// Stand-in when no `[agent] cmd` is set. Operator commands never call it.
#[derive(Debug)]
struct UnconfiguredAgent;

impl Agent for UnconfiguredAgent {
    fn chat(
        &self,
        _request: AgentRequest,
    ) -> Pin<Box<dyn Future<Output = errors::Result<AgentResponse>> + Send + '_>> {
        Box::pin(async {
            Err(MarathonError::ConfigError(
                "no agent command configured".to_string(),
            ))
        })
    }
}

/// Resolve a user-supplied working directory against the current one.
pub fn resolve_workdir(dir: Option<PathBuf>) -> std::io::Result<PathBuf> {
    match dir {
        Some(dir) if dir.is_absolute() => Ok(dir),
        Some(dir) => Ok(std::env::current_dir()?.join(dir)),
        None => std::env::current_dir(),
    }
}
