use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to open state database {path}: {source}")]
    Open {
        source: rusqlite::Error,
        path: PathBuf,
    },
    #[error("state database error: {0}")]
    Execute(#[from] rusqlite::Error),
    #[error("state store path not configured")]
    MissingStore,
    #[error("failed to encode alert state: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("state backend unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;
