use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io { source: io::Error, path: PathBuf },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        source: toml::de::Error,
        path: PathBuf,
    },
    #[error("provided argument \"{field}: {pattern}\" must be a valid regex pattern: {reason}")]
    InvalidPattern {
        field: &'static str,
        pattern: String,
        reason: String,
    },
    #[error("provided argument \"threshold: {0}\" must be defined as a positive integer")]
    InvalidThreshold(String),
    #[error("provided argument \"snooze_minute_delay: {0}\" must be a positive integer")]
    InvalidSnoozeDelay(String),
    #[error("provided argument \"notify_on_recovery: {0}\" must be a boolean")]
    InvalidRecoveryFlag(String),
    #[error("monitor identity {0:?} must be non-empty and must not contain ':'")]
    InvalidIdentity(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;
