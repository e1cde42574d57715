use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use rusqlite::{Connection, OpenFlags};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::config::EngineSection;
use crate::sqlite::configure_read_only;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to open job database {path}: {source}")]
    Open {
        source: rusqlite::Error,
        path: PathBuf,
    },
    #[error("job database error: {0}")]
    Execute(#[from] rusqlite::Error),
    #[error("job database path not configured")]
    MissingStore,
    #[error("invalid SQL identifier: {0:?}")]
    InvalidIdentifier(String),
    #[error("queue {0} is unavailable")]
    Unavailable(String),
    #[error("job database query aborted: {0}")]
    Aborted(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

/// The job system whose queues are being watched.
#[async_trait]
pub trait QueueEngine: Send + Sync {
    async fn list_queues(&self) -> EngineResult<Vec<String>>;

    async fn queue_size(&self, queue: &str) -> EngineResult<u64>;
}

/// Fixed queue sizes, adjustable between runs.
#[derive(Debug, Default)]
pub struct StaticQueueEngine {
    sizes: RwLock<BTreeMap<String, u64>>,
    unavailable: RwLock<BTreeSet<String>>,
}

impl StaticQueueEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sizes<I, S>(sizes: I) -> Self
    where
        I: IntoIterator<Item = (S, u64)>,
        S: Into<String>,
    {
        Self {
            sizes: RwLock::new(
                sizes
                    .into_iter()
                    .map(|(queue, size)| (queue.into(), size))
                    .collect(),
            ),
            unavailable: RwLock::default(),
        }
    }

    pub async fn set_size(&self, queue: impl Into<String>, size: u64) {
        self.sizes.write().await.insert(queue.into(), size);
    }

    /// Makes size lookups for `queue` fail until [`Self::restore`] is called.
    pub async fn make_unavailable(&self, queue: impl Into<String>) {
        self.unavailable.write().await.insert(queue.into());
    }

    pub async fn restore(&self, queue: &str) {
        self.unavailable.write().await.remove(queue);
    }
}

#[async_trait]
impl QueueEngine for StaticQueueEngine {
    async fn list_queues(&self) -> EngineResult<Vec<String>> {
        Ok(self.sizes.read().await.keys().cloned().collect())
    }

    async fn queue_size(&self, queue: &str) -> EngineResult<u64> {
        if self.unavailable.read().await.contains(queue) {
            return Err(EngineError::Unavailable(queue.to_string()));
        }
        Ok(self.sizes.read().await.get(queue).copied().unwrap_or(0))
    }
}

#[derive(Debug, Clone)]
pub struct SqliteQueueEngineBuilder {
    path: Option<PathBuf>,
    table: String,
    queue_column: String,
    pending_status: Option<String>,
}

impl Default for SqliteQueueEngineBuilder {
    fn default() -> Self {
        Self {
            path: None,
            table: "jobs".to_string(),
            queue_column: "queue".to_string(),
            pending_status: None,
        }
    }
}

impl SqliteQueueEngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_section(section: &EngineSection) -> Self {
        Self {
            path: Some(section.path.clone()),
            table: section.table.clone(),
            queue_column: section.queue_column.clone(),
            pending_status: section.pending_status.clone(),
        }
    }

    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    pub fn queue_column(mut self, column: impl Into<String>) -> Self {
        self.queue_column = column.into();
        self
    }

    /// Only rows whose `status` column equals this value count towards the
    /// queue size.
    pub fn pending_status(mut self, status: impl Into<String>) -> Self {
        self.pending_status = Some(status.into());
        self
    }

    pub fn build(self) -> EngineResult<SqliteQueueEngine> {
        let path = self.path.ok_or(EngineError::MissingStore)?;
        let table = checked_identifier(self.table)?;
        let queue_column = checked_identifier(self.queue_column)?;

        let list_sql = format!(
            "SELECT DISTINCT {queue_column} FROM {table} WHERE {queue_column} IS NOT NULL ORDER BY {queue_column}"
        );
        let size_sql = match self.pending_status {
            Some(_) => format!(
                "SELECT COUNT(*) FROM {table} WHERE {queue_column} = ?1 AND status = ?2"
            ),
            None => format!("SELECT COUNT(*) FROM {table} WHERE {queue_column} = ?1"),
        };

        Ok(SqliteQueueEngine {
            path,
            list_sql,
            size_sql,
            pending_status: self.pending_status,
        })
    }
}

fn checked_identifier(value: String) -> EngineResult<String> {
    let mut chars = value.chars();
    let valid = chars
        .next()
        .map(|first| first.is_ascii_alphabetic() || first == '_')
        .unwrap_or(false)
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(value)
    } else {
        Err(EngineError::InvalidIdentifier(value))
    }
}

/// Reads queue depth from a job table in a SQLite database owned by the job
/// system. Queues are every distinct value of the queue column, whatever the
/// job status, so that a drained queue is still seen and can recover.
#[derive(Debug, Clone)]
pub struct SqliteQueueEngine {
    path: PathBuf,
    list_sql: String,
    size_sql: String,
    pending_status: Option<String>,
}

impl SqliteQueueEngine {
    pub fn builder() -> SqliteQueueEngineBuilder {
        SqliteQueueEngineBuilder::new()
    }

    fn open(&self) -> EngineResult<Connection> {
        let conn = Connection::open_with_flags(&self.path, OpenFlags::SQLITE_OPEN_READ_ONLY)
            .map_err(|source| EngineError::Open {
                source,
                path: self.path.clone(),
            })?;
        configure_read_only(&conn).map_err(|source| EngineError::Open {
            source,
            path: self.path.clone(),
        })?;
        Ok(conn)
    }

    fn list_queues_blocking(&self) -> EngineResult<Vec<String>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(&self.list_sql)?;
        let queues = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(queues)
    }

    fn queue_size_blocking(&self, queue: &str) -> EngineResult<u64> {
        let conn = self.open()?;
        let count: i64 = match &self.pending_status {
            Some(status) => {
                conn.query_row(&self.size_sql, [queue, status.as_str()], |row| row.get(0))?
            }
            None => conn.query_row(&self.size_sql, [queue], |row| row.get(0))?,
        };
        Ok(count.max(0) as u64)
    }
}

async fn blocking<T, F>(task: F) -> EngineResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> EngineResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|err| EngineError::Aborted(err.to_string()))?
}

#[async_trait]
impl QueueEngine for SqliteQueueEngine {
    async fn list_queues(&self) -> EngineResult<Vec<String>> {
        let engine = self.clone();
        blocking(move || engine.list_queues_blocking()).await
    }

    async fn queue_size(&self, queue: &str) -> EngineResult<u64> {
        let engine = self.clone();
        let queue = queue.to_string();
        blocking(move || engine.queue_size_blocking(&queue)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn seed_jobs(path: &Path) {
        let conn = Connection::open(path).unwrap();
        conn.execute_batch(
            "CREATE TABLE jobs (id INTEGER PRIMARY KEY, queue TEXT, status TEXT);
             INSERT INTO jobs (queue, status) VALUES
                ('orders', 'queued'), ('orders', 'queued'), ('orders', 'done'),
                ('mail', 'done'), (NULL, 'queued');",
        )
        .unwrap();
    }

    #[tokio::test]
    async fn sqlite_engine_counts_rows_per_queue() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("jobs.sqlite");
        seed_jobs(&path);

        let engine = SqliteQueueEngine::builder().path(&path).build().unwrap();
        assert_eq!(engine.list_queues().await.unwrap(), vec!["mail", "orders"]);
        assert_eq!(engine.queue_size("orders").await.unwrap(), 3);
        assert_eq!(engine.queue_size("missing").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn sqlite_engine_filters_pending_status() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("jobs.sqlite");
        seed_jobs(&path);

        let engine = SqliteQueueEngine::builder()
            .path(&path)
            .pending_status("queued")
            .build()
            .unwrap();
        // A drained queue is still listed so that it can recover.
        assert_eq!(engine.list_queues().await.unwrap(), vec!["mail", "orders"]);
        assert_eq!(engine.queue_size("orders").await.unwrap(), 2);
        assert_eq!(engine.queue_size("mail").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn missing_job_table_is_an_execute_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty.sqlite");
        Connection::open(&path)
            .unwrap()
            .execute_batch("CREATE TABLE unrelated (id INTEGER PRIMARY KEY);")
            .unwrap();

        let engine = SqliteQueueEngine::builder().path(&path).build().unwrap();
        assert!(matches!(
            engine.list_queues().await.unwrap_err(),
            EngineError::Execute(_)
        ));
    }

    #[test]
    fn rejects_unsafe_identifiers() {
        let err = SqliteQueueEngine::builder()
            .path("jobs.sqlite")
            .table("jobs; DROP TABLE jobs")
            .build()
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidIdentifier(_)));
    }

    #[tokio::test]
    async fn static_engine_simulates_outages() {
        let engine = StaticQueueEngine::with_sizes([("a", 3), ("b", 7)]);
        engine.make_unavailable("b").await;
        assert_eq!(engine.queue_size("a").await.unwrap(), 3);
        assert!(matches!(
            engine.queue_size("b").await.unwrap_err(),
            EngineError::Unavailable(_)
        ));
        engine.restore("b").await;
        engine.set_size("b", 9).await;
        assert_eq!(engine.queue_size("b").await.unwrap(), 9);
    }
}
