// Daemon settings
//
// Layered: built-in defaults, then the TOML file, then `WARREN__*`
// environment variables (e.g. `WARREN__DISPATCHER__MAX_WORKERS=4`).
// Command-line flags are applied on top by main.

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

use warren_core::application::dispatcher::{DeliveryGuarantee, DispatcherConfig};
use warren_core::domain::ExitMode;

pub const DEFAULT_CONFIG_PATH: &str = "~/.warren/warren.toml";
const ENV_PREFIX: &str = "WARREN";

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub dispatcher: DispatcherSettings,
    pub worker: WorkerSettings,
    pub feed: FeedSettings,
    pub log: LogSettings,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct DispatcherSettings {
    /// -1 means unlimited
    pub max_workers: i64,
    pub cache_limit: i64,
    pub patrol_period_secs: u64,
    pub shutdown_timeout_secs: i64,
    pub worker_capacity: usize,
    pub delivery_guarantee: DeliveryGuarantee,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        let defaults = DispatcherConfig::default();
        Self {
            max_workers: -1,
            cache_limit: defaults.cache_limit as i64,
            patrol_period_secs: defaults.patrol_period.as_secs(),
            shutdown_timeout_secs: defaults.shutdown_timeout.as_secs() as i64,
            worker_capacity: defaults.worker_capacity,
            delivery_guarantee: defaults.delivery_guarantee,
        }
    }
}

impl DispatcherSettings {
    /// Out-of-range values keep the default and are logged
    pub fn to_config(&self) -> DispatcherConfig {
        let mut config = DispatcherConfig::default();
        if !config.set_max_workers(self.max_workers) {
            warn!(value = self.max_workers, "Ignoring invalid dispatcher.max_workers");
        }
        if !config.set_cache_limit(self.cache_limit) {
            warn!(value = self.cache_limit, "Ignoring invalid dispatcher.cache_limit");
        }
        if !config.set_patrol_period(self.patrol_period_secs) {
            warn!(value = self.patrol_period_secs, "Ignoring invalid dispatcher.patrol_period_secs");
        }
        if !config.set_shutdown_timeout(self.shutdown_timeout_secs) {
            warn!(value = self.shutdown_timeout_secs, "Ignoring invalid dispatcher.shutdown_timeout_secs");
        }
        if !config.set_worker_capacity(self.worker_capacity) {
            warn!(value = self.worker_capacity, "Ignoring invalid dispatcher.worker_capacity");
        }
        config.delivery_guarantee = self.delivery_guarantee;
        config
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkerSettings {
    /// 0 disables idle shutdown
    pub idle_shutdown_secs: u64,
    pub exit_mode: ExitMode,
    pub patrol_period_secs: u64,
    /// Program and arguments run for every message; empty logs messages only
    pub command: Vec<String>,
    pub command_timeout_secs: Option<u64>,
    /// Environment passed to worker processes and their commands
    pub env_allowlist: Vec<String>,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            idle_shutdown_secs: 0,
            exit_mode: ExitMode::Active,
            patrol_period_secs: 60,
            command: Vec::new(),
            command_timeout_secs: None,
            env_allowlist: ["PATH", "HOME", "USER", "LANG", "RUST_LOG"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

impl WorkerSettings {
    pub fn command_timeout(&self) -> Option<Duration> {
        self.command_timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct FeedSettings {
    pub queue: String,
    /// Read messages from this file instead of stdin
    pub input: Option<PathBuf>,
    /// Shut down once the input is exhausted
    pub exit_on_eof: bool,
}

impl Default for FeedSettings {
    fn default() -> Self {
        Self {
            queue: "default".to_string(),
            input: None,
            exit_on_eof: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogSettings {
    /// `pretty` or `json`
    pub format: String,
    /// EnvFilter directives; RUST_LOG wins when set
    pub filter: Option<String>,
    /// Also write to a daily rolling file
    pub file: Option<PathBuf>,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            format: "pretty".to_string(),
            filter: None,
            file: None,
        }
    }
}

impl Settings {
    /// An explicit `path` must exist; the default location is optional
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, required) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => (
                PathBuf::from(shellexpand::tilde(DEFAULT_CONFIG_PATH).into_owned()),
                false,
            ),
        };

        Config::builder()
            .add_source(
                File::from(path.as_path())
                    .format(FileFormat::Toml)
                    .required(required),
            )
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|config| config.try_deserialize())
            .with_context(|| format!("Failed to load configuration from {}", path.display()))
    }
}
