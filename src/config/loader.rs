// src/config/loader.rs

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::config::model::{RawSettings, Settings};
use crate::errors::Result;

/// Load a settings file and return the raw, unvalidated `RawSettings`.
///
/// This only performs TOML deserialization. Use [`load_settings`] for the
/// validated form.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<RawSettings> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)?;

    let raw: RawSettings = toml::from_str(&contents)?;

    Ok(raw)
}

/// Load and validate settings.
///
/// A missing file is not an error: every key has a default, so the engine can
/// run without any settings file at all.
pub fn load_settings(path: impl AsRef<Path>) -> Result<Settings> {
    let path = path.as_ref();
    if !path.exists() {
        debug!(path = %path.display(), "settings file not found; using defaults");
        return Settings::try_from(RawSettings::default());
    }

    let raw = load_from_path(path)?;
    Settings::try_from(raw)
}

/// Default settings path: `Marathon.toml` in the current working directory.
pub fn default_config_path() -> PathBuf {
    PathBuf::from("Marathon.toml")
}
