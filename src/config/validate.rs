// src/config/validate.rs

use std::time::Duration;

use crate::approval::ApprovalPolicy;
use crate::config::duration::parse_duration;
use crate::config::model::{
    AgentSettings, ApprovalSettings, EngineSettings, EventSettings, RawSettings, Settings,
    StorageSettings, WatchdogSettings, default_flagged_commands,
};
use crate::errors::{MarathonError, Result};

impl TryFrom<RawSettings> for Settings {
    type Error = MarathonError;

    fn try_from(raw: RawSettings) -> std::result::Result<Self, Self::Error> {
        let defaults = Settings::default();

        let engine = EngineSettings {
            heartbeat_interval: duration_or(
                "engine.heartbeat_interval",
                raw.engine.heartbeat_interval.as_deref(),
                defaults.engine.heartbeat_interval,
            )?,
            heartbeat_timeout: duration_or(
                "engine.heartbeat_timeout",
                raw.engine.heartbeat_timeout.as_deref(),
                defaults.engine.heartbeat_timeout,
            )?,
            approval_poll_interval: duration_or(
                "engine.approval_poll_interval",
                raw.engine.approval_poll_interval.as_deref(),
                defaults.engine.approval_poll_interval,
            )?,
            milestone_delay: duration_or(
                "engine.milestone_delay",
                raw.engine.milestone_delay.as_deref(),
                defaults.engine.milestone_delay,
            )?,
            max_log_entries: raw
                .engine
                .max_log_entries
                .unwrap_or(defaults.engine.max_log_entries),
            notify_channel: raw.engine.notify_channel,
        };

        let watchdog = WatchdogSettings {
            scan_interval: duration_or(
                "watchdog.scan_interval",
                raw.watchdog.scan_interval.as_deref(),
                defaults.watchdog.scan_interval,
            )?,
            max_restarts: raw
                .watchdog
                .max_restarts
                .unwrap_or(defaults.watchdog.max_restarts),
            auto_resume: raw
                .watchdog
                .auto_resume
                .unwrap_or(defaults.watchdog.auto_resume),
            alert_channels: raw.watchdog.alert_channels,
        };

        let approval = ApprovalSettings {
            require_for_file_delete: raw.approval.require_for_file_delete.unwrap_or(true),
            delete_patterns: raw.approval.delete_patterns,
            flagged_commands: raw
                .approval
                .flagged_commands
                .unwrap_or_else(default_flagged_commands),
            require_for_payments: raw.approval.require_for_payments.unwrap_or(true),
            require_for_outbound_messages: raw
                .approval
                .require_for_outbound_messages
                .unwrap_or(true),
            custom_patterns: raw.approval.custom_patterns,
            auto_approve_after: optional_duration(
                "approval.auto_approve_after",
                raw.approval.auto_approve_after.as_deref(),
            )?,
            expires_after: optional_duration(
                "approval.expires_after",
                raw.approval.expires_after.as_deref(),
            )?,
            notify_channel: raw.approval.notify_channel,
        };

        let events = EventSettings {
            capacity: raw.events.capacity.unwrap_or(defaults.events.capacity),
            backpressure: raw.events.backpressure,
            heartbeat_throttle: duration_or(
                "events.heartbeat_throttle",
                raw.events.heartbeat_throttle.as_deref(),
                defaults.events.heartbeat_throttle,
            )?,
            log_file: raw.events.log_file,
        };

        let agent = AgentSettings {
            cmd: raw.agent.cmd,
            timeout: duration_or(
                "agent.timeout",
                raw.agent.timeout.as_deref(),
                defaults.agent.timeout,
            )?,
        };

        let storage = StorageSettings {
            state_dir: raw
                .storage
                .state_dir
                .unwrap_or(defaults.storage.state_dir),
        };

        let settings = Settings {
            engine,
            watchdog,
            approval,
            events,
            agent,
            storage,
        };
        validate_settings(&settings)?;
        Ok(settings)
    }
}

/// Check cross-field invariants of already-typed settings.
pub fn validate_settings(settings: &Settings) -> Result<()> {
    validate_engine(&settings.engine)?;
    validate_watchdog(&settings.watchdog)?;
    validate_events(&settings.events)?;

    // Surfaces bad regex / glob patterns at load time instead of at first use.
    ApprovalPolicy::compile(&settings.approval)?;

    if let Some(cmd) = &settings.agent.cmd {
        if cmd.trim().is_empty() {
            return Err(MarathonError::ConfigError(
                "[agent].cmd must not be empty".to_string(),
            ));
        }
    }

    Ok(())
}

fn validate_engine(engine: &EngineSettings) -> Result<()> {
    ensure_non_zero("engine.heartbeat_interval", engine.heartbeat_interval)?;
    ensure_non_zero("engine.heartbeat_timeout", engine.heartbeat_timeout)?;
    ensure_non_zero("engine.approval_poll_interval", engine.approval_poll_interval)?;

    if engine.heartbeat_timeout <= engine.heartbeat_interval {
        return Err(MarathonError::ConfigError(format!(
            "[engine].heartbeat_timeout ({:?}) must be greater than heartbeat_interval ({:?})",
            engine.heartbeat_timeout, engine.heartbeat_interval
        )));
    }

    if engine.max_log_entries == 0 {
        return Err(MarathonError::ConfigError(
            "[engine].max_log_entries must be >= 1 (got 0)".to_string(),
        ));
    }
    Ok(())
}

fn validate_watchdog(watchdog: &WatchdogSettings) -> Result<()> {
    ensure_non_zero("watchdog.scan_interval", watchdog.scan_interval)
}

fn validate_events(events: &EventSettings) -> Result<()> {
    if events.capacity == 0 {
        return Err(MarathonError::ConfigError(
            "[events].capacity must be >= 1 (got 0)".to_string(),
        ));
    }
    Ok(())
}

fn ensure_non_zero(key: &str, value: Duration) -> Result<()> {
    if value.is_zero() {
        return Err(MarathonError::ConfigError(format!(
            "{key} must be greater than zero"
        )));
    }
    Ok(())
}

fn duration_or(key: &str, raw: Option<&str>, default: Duration) -> Result<Duration> {
    Ok(optional_duration(key, raw)?.unwrap_or(default))
}

fn optional_duration(key: &str, raw: Option<&str>) -> Result<Option<Duration>> {
    raw.map(|s| {
        parse_duration(s).map_err(|e| MarathonError::ConfigError(format!("{key}: {e}")))
    })
    .transpose()
}
