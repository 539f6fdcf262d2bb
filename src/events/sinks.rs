// src/events/sinks.rs

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::events::{EventEnvelope, EventSubscriber, MarathonEvent};

/// Consumer side of the event channel.
pub trait EventSink: Send {
    fn handle(&mut self, envelope: &EventEnvelope) -> Result<()>;

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Human-readable progress lines on stdout.
#[derive(Debug, Default)]
pub struct ConsoleSink {
    /// Print heartbeat events too.
    pub verbose: bool,
}

impl EventSink for ConsoleSink {
    fn handle(&mut self, envelope: &EventEnvelope) -> Result<()> {
        if envelope.event.is_heartbeat() && !self.verbose {
            return Ok(());
        }
        println!(
            "[{}] {} {}",
            envelope.at.format("%H:%M:%S"),
            short_id(&envelope.marathon_id),
            describe(&envelope.event)
        );
        Ok(())
    }
}

/// Appends one JSON document per event to a file.
pub struct JsonLinesSink {
    writer: BufWriter<File>,
}

impl JsonLinesSink {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating dir {:?}", parent))?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening event log {:?}", path))?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }
}

impl EventSink for JsonLinesSink {
    fn handle(&mut self, envelope: &EventEnvelope) -> Result<()> {
        serde_json::to_writer(&mut self.writer, envelope)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Drain `subscriber` into `sinks` until every publisher is dropped.
///
/// A failing sink is logged and kept; it does not stop the others. Resolves
/// to the number of events handled.
pub fn spawn_event_pump(
    mut subscriber: EventSubscriber,
    mut sinks: Vec<Box<dyn EventSink>>,
) -> JoinHandle<u64> {
    tokio::spawn(async move {
        let mut handled = 0u64;
        while let Some(envelope) = subscriber.recv().await {
            for sink in sinks.iter_mut() {
                if let Err(e) = sink.handle(&envelope) {
                    warn!(error = %e, "event sink failed");
                }
            }
            handled += 1;
            // Flush whenever the queue runs dry.
            if subscriber.is_empty() {
                for sink in sinks.iter_mut() {
                    if let Err(e) = sink.flush() {
                        warn!(error = %e, "event sink flush failed");
                    }
                }
            }
        }
        for sink in sinks.iter_mut() {
            let _ = sink.flush();
        }
        let dropped = subscriber.dropped();
        debug!(handled, dropped, "event pump finished");
        handled
    })
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

pub fn describe(event: &MarathonEvent) -> String {
    match event {
        MarathonEvent::Started { goal, milestones } => {
            format!("started: {goal} ({milestones} milestones)")
        }
        MarathonEvent::MilestoneStarted { milestone_id, title } => {
            format!("milestone {milestone_id} started: {title}")
        }
        MarathonEvent::MilestoneCompleted {
            milestone_id,
            elapsed_ms,
        } => format!("milestone {milestone_id} completed in {elapsed_ms}ms"),
        MarathonEvent::MilestoneRetry {
            milestone_id,
            attempt,
            error,
        } => format!("milestone {milestone_id} retry {attempt}: {error}"),
        MarathonEvent::MilestoneFailed {
            milestone_id,
            error,
            skipped,
        } => {
            if skipped.is_empty() {
                format!("milestone {milestone_id} failed: {error}")
            } else {
                format!(
                    "milestone {milestone_id} failed: {error} (skipped: {})",
                    skipped.join(", ")
                )
            }
        }
        MarathonEvent::LoopDetected {
            milestone_id,
            occurrences,
        } => format!("loop detected in {milestone_id} ({occurrences} repeats)"),
        MarathonEvent::ApprovalRequested {
            request_id,
            tier,
            description,
        } => format!("approval {request_id} requested ({tier}): {description}"),
        MarathonEvent::ApprovalResolved {
            request_id,
            approved,
            by,
        } => format!(
            "approval {request_id} {} by {}",
            if *approved { "approved" } else { "rejected" },
            by.as_deref().unwrap_or("unknown")
        ),
        MarathonEvent::Heartbeat { last_action } => {
            format!("heartbeat ({})", last_action.as_deref().unwrap_or("-"))
        }
        MarathonEvent::StatusChanged { status } => format!("status -> {status}"),
        MarathonEvent::Finished { status, summary } => format!("finished {status}: {summary}"),
        MarathonEvent::CrashDetected {
            heartbeat_age_ms,
            restarts,
            ..
        } => format!("crash detected (heartbeat {heartbeat_age_ms}ms old, {restarts} restarts)"),
        MarathonEvent::Resumed {
            restart,
            max_restarts,
        } => format!("resumed by watchdog ({restart}/{max_restarts})"),
        MarathonEvent::MaxRestartsExceeded { restarts } => {
            format!("giving up after {restarts} restarts")
        }
    }
}
