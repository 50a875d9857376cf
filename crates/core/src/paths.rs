//! Centralized path functions for watcher storage locations.

use std::path::PathBuf;

/// App data root: `~/Library/Application Support/scanwatch/` (macOS) or
/// `~/.local/share/scanwatch/` (Linux).
pub fn app_data_dir() -> Option<PathBuf> {
    dirs::data_dir().map(|d| d.join("scanwatch"))
}

/// Checkpoint and current-job store: `<app_data_dir>/state/`.
pub fn state_dir() -> Option<PathBuf> {
    app_data_dir().map(|d| d.join("state"))
}

/// Default config file: `<config dir>/scanwatch/config.toml`.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("scanwatch").join("config.toml"))
}
