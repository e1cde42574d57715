use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use tokio::sync::Mutex;

use crate::sqlite::{configure_connection, configure_read_only};

use super::{StoreError, StoreResult};

const ALERT_STATE_SCHEMA: &str = include_str!("../../../sql/alert_state.sql");

/// Raw byte storage for alert state records.
#[async_trait]
pub trait KeyValueBackend: Send + Sync {
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;

    async fn set(&self, key: &str, value: &[u8]) -> StoreResult<()>;

    /// Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> StoreResult<()>;

    async fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<(String, Vec<u8>)>>;
}

#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

#[async_trait]
impl KeyValueBackend for MemoryBackend {
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        self.entries
            .lock()
            .await
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<(String, Vec<u8>)>> {
        let entries = self.entries.lock().await;
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }
}

#[derive(Debug, Clone)]
pub struct SqliteBackendBuilder {
    path: Option<PathBuf>,
    read_only: bool,
    create_if_missing: bool,
}

impl Default for SqliteBackendBuilder {
    fn default() -> Self {
        Self {
            path: None,
            read_only: false,
            create_if_missing: true,
        }
    }
}

impl SqliteBackendBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    pub fn build(self) -> StoreResult<SqliteBackend> {
        let path = self.path.ok_or(StoreError::MissingStore)?;
        let mut flags = if self.read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE
        };
        if !self.read_only && self.create_if_missing {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
        }
        Ok(SqliteBackend {
            path,
            flags,
            read_only: self.read_only,
        })
    }
}

/// Alert state kept in a single `alert_state` table, one row per key.
///
/// Every call opens its own connection so that several runner processes can
/// share the same file. Queries run on the blocking pool.
#[derive(Debug, Clone)]
pub struct SqliteBackend {
    path: PathBuf,
    flags: OpenFlags,
    read_only: bool,
}

impl SqliteBackend {
    pub fn builder() -> SqliteBackendBuilder {
        SqliteBackendBuilder::new()
    }

    pub fn new(path: impl AsRef<Path>) -> StoreResult<Self> {
        SqliteBackendBuilder::new().path(path).build()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn open(&self) -> StoreResult<Connection> {
        let conn = Connection::open_with_flags(&self.path, self.flags).map_err(|source| {
            StoreError::Open {
                source,
                path: self.path.clone(),
            }
        })?;
        let configured = if self.read_only {
            configure_read_only(&conn)
        } else {
            configure_connection(&conn)
        };
        configured.map_err(|source| StoreError::Open {
            source,
            path: self.path.clone(),
        })?;
        Ok(conn)
    }

    pub fn initialize(&self) -> StoreResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|err| StoreError::Unavailable(err.to_string()))?;
            }
        }
        let conn = self.open()?;
        conn.execute_batch(ALERT_STATE_SCHEMA)?;
        Ok(())
    }

    fn get_blocking(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let conn = self.open()?;
        let value = conn
            .query_row(
                "SELECT value FROM alert_state WHERE key = ?1",
                [key],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()?;
        Ok(value)
    }

    fn set_blocking(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        let conn = self.open()?;
        conn.execute(
            "INSERT OR REPLACE INTO alert_state (key, value, updated_at)
             VALUES (?1, ?2, CURRENT_TIMESTAMP)",
            params![key, value],
        )?;
        Ok(())
    }

    fn delete_blocking(&self, key: &str) -> StoreResult<()> {
        let conn = self.open()?;
        conn.execute("DELETE FROM alert_state WHERE key = ?1", [key])?;
        Ok(())
    }

    fn scan_prefix_blocking(&self, prefix: &str) -> StoreResult<Vec<(String, Vec<u8>)>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT key, value FROM alert_state WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key",
        )?;
        let rows = stmt
            .query_map([prefix], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

async fn blocking<T, F>(task: F) -> StoreResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> StoreResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|err| StoreError::Unavailable(format!("state query aborted: {err}")))?
}

#[async_trait]
impl KeyValueBackend for SqliteBackend {
    #[tracing::instrument(skip(self), level = "debug")]
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let backend = self.clone();
        let key = key.to_string();
        blocking(move || backend.get_blocking(&key)).await
    }

    #[tracing::instrument(skip(self, value), level = "debug")]
    async fn set(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        let backend = self.clone();
        let key = key.to_string();
        let value = value.to_vec();
        blocking(move || backend.set_blocking(&key, &value)).await
    }

    #[tracing::instrument(skip(self), level = "debug")]
    async fn delete(&self, key: &str) -> StoreResult<()> {
        let backend = self.clone();
        let key = key.to_string();
        blocking(move || backend.delete_blocking(&key)).await
    }

    async fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<(String, Vec<u8>)>> {
        let backend = self.clone();
        let prefix = prefix.to_string();
        blocking(move || backend.scan_prefix_blocking(&prefix)).await
    }
}
