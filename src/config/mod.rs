// src/config/mod.rs

//! Settings loading and validation.
//!
//! - [`model`] defines the TOML-backed raw model and the validated `Settings`.
//! - [`loader`] reads a settings file from disk.
//! - [`validate`] turns `RawSettings` into `Settings`, checking invariants.
//! - [`duration`] parses `"30s"`-style duration strings.

pub mod duration;
pub mod loader;
pub mod model;
pub mod validate;

pub use duration::{format_duration, parse_duration};
pub use loader::{default_config_path, load_from_path, load_settings};
pub use model::{
    AgentSettings, ApprovalSettings, EngineSettings, EventSettings, RawSettings, Settings,
    StorageSettings, WatchdogSettings,
};
pub use validate::validate_settings;
