// src/config/model.rs

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::types::BackpressurePolicy;

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_APPROVAL_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_MILESTONE_DELAY: Duration = Duration::from_secs(2);
pub const DEFAULT_MAX_LOG_ENTRIES: usize = 200;
pub const DEFAULT_SCAN_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_RESTARTS: u32 = 3;
pub const DEFAULT_EVENT_CAPACITY: usize = 256;
pub const DEFAULT_AGENT_TIMEOUT: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_STATE_DIR: &str = ".marathon/state";

/// Settings file as read from TOML, before validation.
///
/// ```toml
/// [engine]
/// heartbeat_interval = "30s"
/// heartbeat_timeout = "120s"
///
/// [watchdog]
/// scan_interval = "60s"
/// max_restarts = 3
/// alert_channels = ["ops"]
///
/// [approval]
/// flagged_commands = ["rm -rf", "sudo "]
/// auto_approve_after = "10m"
///
/// [agent]
/// cmd = "my-agent --json"
/// ```
///
/// Every section and key is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawSettings {
    #[serde(default)]
    pub engine: RawEngineSection,
    #[serde(default)]
    pub watchdog: RawWatchdogSection,
    #[serde(default)]
    pub approval: RawApprovalSection,
    #[serde(default)]
    pub events: RawEventsSection,
    #[serde(default)]
    pub agent: RawAgentSection,
    #[serde(default)]
    pub storage: RawStorageSection,
}

/// `[engine]` section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawEngineSection {
    pub heartbeat_interval: Option<String>,
    pub heartbeat_timeout: Option<String>,
    pub approval_poll_interval: Option<String>,
    pub milestone_delay: Option<String>,
    pub max_log_entries: Option<usize>,
    pub notify_channel: Option<String>,
}

/// `[watchdog]` section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawWatchdogSection {
    pub scan_interval: Option<String>,
    pub max_restarts: Option<u32>,
    pub auto_resume: Option<bool>,
    #[serde(default)]
    pub alert_channels: Vec<String>,
}

/// `[approval]` section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawApprovalSection {
    pub require_for_file_delete: Option<bool>,
    #[serde(default)]
    pub delete_patterns: Vec<String>,
    pub flagged_commands: Option<Vec<String>>,
    pub require_for_payments: Option<bool>,
    pub require_for_outbound_messages: Option<bool>,
    #[serde(default)]
    pub custom_patterns: Vec<String>,
    pub auto_approve_after: Option<String>,
    pub expires_after: Option<String>,
    pub notify_channel: Option<String>,
}

/// `[events]` section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawEventsSection {
    pub capacity: Option<usize>,
    #[serde(default)]
    pub backpressure: BackpressurePolicy,
    pub heartbeat_throttle: Option<String>,
    pub log_file: Option<PathBuf>,
}

/// `[agent]` section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawAgentSection {
    pub cmd: Option<String>,
    pub timeout: Option<String>,
}

/// `[storage]` section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawStorageSection {
    pub state_dir: Option<PathBuf>,
}

/// Validated settings. Construct via `Settings::try_from(RawSettings)` or
/// [`crate::config::load_settings`].
#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub engine: EngineSettings,
    pub watchdog: WatchdogSettings,
    pub approval: ApprovalSettings,
    pub events: EventSettings,
    pub agent: AgentSettings,
    pub storage: StorageSettings,
}

/// Timing knobs of the executor and heartbeat.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub heartbeat_interval: Duration,
    /// Heartbeat staleness beyond this is the crash signal.
    pub heartbeat_timeout: Duration,
    pub approval_poll_interval: Duration,
    /// Pause between milestones.
    pub milestone_delay: Duration,
    pub max_log_entries: usize,
    /// Channel for milestone and completion notifications.
    pub notify_channel: Option<String>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
            approval_poll_interval: DEFAULT_APPROVAL_POLL_INTERVAL,
            milestone_delay: DEFAULT_MILESTONE_DELAY,
            max_log_entries: DEFAULT_MAX_LOG_ENTRIES,
            notify_channel: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WatchdogSettings {
    pub scan_interval: Duration,
    pub max_restarts: u32,
    pub auto_resume: bool,
    pub alert_channels: Vec<String>,
}

impl Default for WatchdogSettings {
    fn default() -> Self {
        Self {
            scan_interval: DEFAULT_SCAN_INTERVAL,
            max_restarts: DEFAULT_MAX_RESTARTS,
            auto_resume: true,
            alert_channels: Vec::new(),
        }
    }
}

/// Risk policy inputs. Compiled into an
/// [`ApprovalPolicy`](crate::approval::ApprovalPolicy) before use.
#[derive(Debug, Clone)]
pub struct ApprovalSettings {
    pub require_for_file_delete: bool,
    /// Globs limiting which deleted paths need approval. Empty = any path.
    pub delete_patterns: Vec<String>,
    /// Substrings that flag a shell command as risky.
    pub flagged_commands: Vec<String>,
    pub require_for_payments: bool,
    pub require_for_outbound_messages: bool,
    /// Extra regexes; a match requires approval at medium risk.
    pub custom_patterns: Vec<String>,
    pub auto_approve_after: Option<Duration>,
    pub expires_after: Option<Duration>,
    pub notify_channel: Option<String>,
}

pub fn default_flagged_commands() -> Vec<String> {
    ["rm -rf", "sudo ", "git push --force", "mkfs", "dd if="]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for ApprovalSettings {
    fn default() -> Self {
        Self {
            require_for_file_delete: true,
            delete_patterns: Vec::new(),
            flagged_commands: default_flagged_commands(),
            require_for_payments: true,
            require_for_outbound_messages: true,
            custom_patterns: Vec::new(),
            auto_approve_after: None,
            expires_after: None,
            notify_channel: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventSettings {
    pub capacity: usize,
    pub backpressure: BackpressurePolicy,
    /// Minimum spacing between heartbeat events of one marathon.
    pub heartbeat_throttle: Duration,
    pub log_file: Option<PathBuf>,
}

impl Default for EventSettings {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_EVENT_CAPACITY,
            backpressure: BackpressurePolicy::DropOldest,
            heartbeat_throttle: Duration::ZERO,
            log_file: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentSettings {
    /// Shell command used by [`ShellAgent`](crate::agent::ShellAgent).
    pub cmd: Option<String>,
    pub timeout: Duration,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            cmd: None,
            timeout: DEFAULT_AGENT_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StorageSettings {
    pub state_dir: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
        }
    }
}
