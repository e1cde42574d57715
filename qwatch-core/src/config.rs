use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ConfigError, Result};
use crate::validator::{self, MonitorConfig};

pub const DEFAULT_NAMESPACE: &str = "qwatch";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct AppConfig {
    #[serde(default)]
    pub monitor: RawMonitorOptions,
    pub state: StateSection,
    pub engine: EngineSection,
    #[serde(default)]
    pub transport: TransportSection,
    #[serde(default)]
    pub runner: RunnerSection,
}

impl AppConfig {
    /// Resolves relative store paths against the directory holding the config file.
    pub fn resolve_paths<P: AsRef<Path>>(&mut self, base_dir: P) {
        let base_dir = base_dir.as_ref();
        if self.state.path.is_relative() {
            self.state.path = base_dir.join(&self.state.path);
        }
        if self.engine.path.is_relative() {
            self.engine.path = base_dir.join(&self.engine.path);
        }
    }
}

/// Monitor options as written by the operator, before coercion and validation.
///
/// Scalar options are kept loosely typed so that `"100"` and `100` are both
/// accepted as a threshold, the same way the job engine's argument bags were.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawMonitorOptions {
    pub identity: Option<String>,
    pub queues: Option<String>,
    pub excluded_queues: Option<String>,
    pub threshold: Option<Value>,
    pub snooze_minute_delay: Option<Value>,
    pub notify_on_recovery: Option<Value>,
}

impl RawMonitorOptions {
    pub fn validate(&self) -> Result<MonitorConfig> {
        validator::validate(self)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StateSection {
    pub path: PathBuf,
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineSection {
    pub path: PathBuf,
    #[serde(default = "default_table")]
    pub table: String,
    #[serde(default = "default_queue_column")]
    pub queue_column: String,
    pub pending_status: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportSection {
    #[default]
    Log,
    Webhook {
        url: String,
        timeout_seconds: Option<u64>,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunnerSection {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_interval_minutes")]
    pub interval_minutes: u64,
}

impl Default for RunnerSection {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            interval_minutes: default_interval_minutes(),
        }
    }
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

fn default_table() -> String {
    "jobs".to_string()
}

fn default_queue_column() -> String {
    "queue".to_string()
}

fn default_concurrency() -> usize {
    4
}

fn default_interval_minutes() -> u64 {
    5
}

pub fn load_app_config<P: AsRef<Path>>(path: P) -> Result<AppConfig> {
    load_toml(path)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}
