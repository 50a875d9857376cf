// crates/core/src/config.rs
//! Watcher configuration.
//!
//! Resolution order: built-in defaults, then an optional TOML file, then
//! `SCANWATCH_*` environment variables. The CLI applies its flags last.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::paths;
use crate::progress::{RegressionPolicy, DEFAULT_INCREMENTS, PROGRESS_CEILING};
use crate::state_machine::ErrorPolicy;
use crate::types::JobKind;

pub const DEFAULT_API_URL: &str = "http://localhost:8000";
pub const DEFAULT_MAX_RETRIES: u32 = 5;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 1_000;
pub const DEFAULT_TICK_INTERVAL_MS: u64 = 500;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WatchConfig {
    /// REST base, e.g. `http://localhost:8000`.
    pub api_base_url: String,
    /// Streaming base. Derived from `api_base_url` when unset.
    pub ws_base_url: Option<String>,
    /// Consecutive failed connection attempts before a session gives up.
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub tick_interval_ms: u64,
    pub increments: Vec<u8>,
    pub request_timeout_secs: u64,
    pub state_dir: Option<PathBuf>,
    pub regression: RegressionPolicy,
    /// Per-kind overrides; kinds not listed use [`ErrorPolicy::default`].
    pub error_policy: HashMap<JobKind, ErrorPolicy>,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_URL.to_string(),
            ws_base_url: None,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
            increments: DEFAULT_INCREMENTS.to_vec(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            state_dir: None,
            regression: RegressionPolicy::default(),
            error_policy: HashMap::new(),
        }
    }
}

impl WatchConfig {
    /// Load from `path` (or the default location when it exists), then apply
    /// environment overrides. An explicit path that does not exist is an error.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match paths::default_config_path().filter(|p| p.exists()) {
                Some(default) => Self::from_file(&default)?,
                None => Self::default(),
            },
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::io(path, e))?;
        toml::from_str(&contents).map_err(|e| ConfigError::Malformed {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Apply `SCANWATCH_*` overrides through `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("SCANWATCH_API_URL").filter(|v| !v.is_empty()) {
            self.api_base_url = url;
        }
        if let Some(url) = lookup("SCANWATCH_WS_URL").filter(|v| !v.is_empty()) {
            self.ws_base_url = Some(url);
        }
        if let Some(dir) = lookup("SCANWATCH_STATE_DIR").filter(|v| !v.is_empty()) {
            self.state_dir = Some(PathBuf::from(dir));
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.api_base_url.starts_with("http://") || self.api_base_url.starts_with("https://")) {
            return Err(ConfigError::invalid(
                "api_base_url",
                format!("expected http(s) URL, got '{}'", self.api_base_url),
            ));
        }
        if let Some(ws) = &self.ws_base_url {
            if !(ws.starts_with("ws://") || ws.starts_with("wss://")) {
                return Err(ConfigError::invalid(
                    "ws_base_url",
                    format!("expected ws(s) URL, got '{ws}'"),
                ));
            }
        }
        if self.max_retries == 0 {
            return Err(ConfigError::invalid("max_retries", "must be at least 1"));
        }
        if self.tick_interval_ms == 0 {
            return Err(ConfigError::invalid("tick_interval_ms", "must be positive"));
        }
        if self.increments.is_empty() {
            return Err(ConfigError::invalid("increments", "must not be empty"));
        }
        if let Some(bad) = self
            .increments
            .iter()
            .find(|&&step| step == 0 || step > PROGRESS_CEILING)
        {
            return Err(ConfigError::invalid(
                "increments",
                format!("step {bad} outside 1..={PROGRESS_CEILING}"),
            ));
        }
        Ok(())
    }

    pub fn api_base(&self) -> &str {
        self.api_base_url.trim_end_matches('/')
    }

    /// Streaming base: explicit value, or the API base with its scheme swapped.
    pub fn ws_base(&self) -> String {
        match &self.ws_base_url {
            Some(ws) => ws.trim_end_matches('/').to_string(),
            None => {
                let api = self.api_base();
                if let Some(rest) = api.strip_prefix("https://") {
                    format!("wss://{rest}")
                } else if let Some(rest) = api.strip_prefix("http://") {
                    format!("ws://{rest}")
                } else {
                    api.to_string()
                }
            }
        }
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn error_policy_for(&self, kind: JobKind) -> ErrorPolicy {
        self.error_policy.get(&kind).copied().unwrap_or_default()
    }

    pub fn resolved_state_dir(&self) -> Result<PathBuf, ConfigError> {
        match &self.state_dir {
            Some(dir) => Ok(dir.clone()),
            None => paths::state_dir().ok_or(ConfigError::DataDirNotFound),
        }
    }
}
