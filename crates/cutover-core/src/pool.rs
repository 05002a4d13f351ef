//! Connection pooling for environment database files.
//!
//! Every environment owns one pool of SQLite connections to its file. Work is
//! handed to the blocking thread pool and bounded by a statement timeout; a
//! statement that runs past it is interrupted and reported as
//! [`Error::StatementTimeout`].

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::types::Value;
use rusqlite::{Connection, OpenFlags};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Default per-statement timeout.
pub const DEFAULT_STATEMENT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default SQLite busy timeout.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration for a connection pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of connections open at once.
    pub max_connections: usize,
    /// Timeout for acquiring a connection from the pool.
    pub acquire_timeout: Duration,
    /// Upper bound on a single unit of work handed to a connection.
    pub statement_timeout: Duration,
    /// How long SQLite waits on a locked database before failing.
    pub busy_timeout: Duration,
}

impl PoolConfig {
    /// Set the maximum connections.
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max.max(1);
        self
    }

    /// Set the acquire timeout.
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Set the statement timeout.
    pub fn with_statement_timeout(mut self, timeout: Duration) -> Self {
        self.statement_timeout = timeout;
        self
    }

    /// Set the busy timeout.
    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 4,
            acquire_timeout: Duration::from_secs(30),
            statement_timeout: DEFAULT_STATEMENT_TIMEOUT,
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        }
    }
}

/// Rows returned by a query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryRows {
    /// Column names in result order.
    pub columns: Vec<String>,
    /// Row values, one vector per row.
    pub rows: Vec<Vec<Value>>,
}

impl QueryRows {
    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Check if no rows were returned.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Get a cell by row index and column name.
    pub fn get(&self, row: usize, column: &str) -> Option<&Value> {
        let idx = self.columns.iter().position(|c| c == column)?;
        self.rows.get(row)?.get(idx)
    }

    /// The first cell of the first row, if it is an integer.
    pub fn scalar_i64(&self) -> Option<i64> {
        match self.rows.first()?.first()? {
            Value::Integer(v) => Some(*v),
            _ => None,
        }
    }
}

/// Internal pool state.
struct PoolInner {
    path: PathBuf,
    config: PoolConfig,
    idle: Mutex<Vec<Connection>>,
    semaphore: Semaphore,
    closed: AtomicBool,
}

impl PoolInner {
    fn connect(&self) -> Result<Connection> {
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX
                | OpenFlags::SQLITE_OPEN_URI,
        )?;
        conn.busy_timeout(self.config.busy_timeout)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        conn.pragma_update(None, "foreign_keys", true)?;
        debug!(path = %self.path.display(), "opened connection");
        Ok(conn)
    }

    fn closed_error(&self) -> Error {
        Error::PoolClosed {
            path: self.path.display().to_string(),
        }
    }
}

/// A pool of connections to one database file.
///
/// Cloning is cheap; clones share the same connections.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Open a pool for the database file at `path`, creating the file if needed.
    ///
    /// One connection is opened eagerly so a bad path fails here rather than
    /// on first use.
    pub fn open(path: impl AsRef<Path>, config: PoolConfig) -> Result<Self> {
        let max = config.max_connections.max(1);
        let inner = PoolInner {
            path: path.as_ref().to_path_buf(),
            semaphore: Semaphore::new(max),
            config,
            idle: Mutex::new(Vec::with_capacity(max)),
            closed: AtomicBool::new(false),
        };
        let first = inner.connect()?;
        inner.idle.lock().push(first);

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Path of the database file.
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Pool configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Check whether the pool has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Number of idle connections held by the pool.
    pub fn idle_connections(&self) -> usize {
        self.inner.idle.lock().len()
    }

    /// Run `f` against one pooled connection on the blocking thread pool.
    pub async fn with_connection<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        if self.is_closed() {
            return Err(self.inner.closed_error());
        }

        let acquire_timeout = self.inner.config.acquire_timeout;
        let _permit = tokio::time::timeout(acquire_timeout, self.inner.semaphore.acquire())
            .await
            .map_err(|_| Error::AcquireTimeout {
                timeout: acquire_timeout,
            })?
            .map_err(|_| self.inner.closed_error())?;

        // Re-check after waiting: close() may have run in the meantime.
        if self.is_closed() {
            return Err(self.inner.closed_error());
        }

        let pooled = self.inner.idle.lock().pop();
        let mut conn = match pooled {
            Some(conn) => conn,
            None => self.inner.connect()?,
        };

        let interrupt = conn.get_interrupt_handle();
        let mut handle = tokio::task::spawn_blocking(move || {
            let result = f(&mut conn);
            (conn, result)
        });

        let statement_timeout = self.inner.config.statement_timeout;
        let outcome = tokio::time::timeout(statement_timeout, &mut handle).await;
        let (conn, result) = match outcome {
            Ok(joined) => joined.map_err(|e| Error::Task(e.to_string()))?,
            Err(_) => {
                warn!(
                    path = %self.inner.path.display(),
                    timeout_ms = statement_timeout.as_millis() as u64,
                    "statement timed out, interrupting"
                );
                interrupt.interrupt();
                let (conn, _) = handle.await.map_err(|e| Error::Task(e.to_string()))?;
                self.release(conn);
                return Err(Error::StatementTimeout {
                    timeout: statement_timeout,
                });
            }
        };

        self.release(conn);
        result
    }

    /// Run a query and collect every row.
    pub async fn query(&self, sql: impl Into<String>, params: Vec<Value>) -> Result<QueryRows> {
        let sql = sql.into();
        self.with_connection(move |conn| query_rows(conn, &sql, &params))
            .await
    }

    /// Execute a single statement, returning the number of rows changed.
    pub async fn execute(&self, sql: impl Into<String>, params: Vec<Value>) -> Result<usize> {
        let sql = sql.into();
        self.with_connection(move |conn| {
            let changed = conn.execute(&sql, rusqlite::params_from_iter(params.iter()))?;
            Ok(changed)
        })
        .await
    }

    /// Execute a script of one or more statements.
    pub async fn execute_batch(&self, sql: impl Into<String>) -> Result<()> {
        let sql = sql.into();
        self.with_connection(move |conn| {
            conn.execute_batch(&sql)?;
            Ok(())
        })
        .await
    }

    /// Close the pool.
    ///
    /// Idle connections are dropped immediately; a connection that is busy
    /// is dropped when its work finishes. Later calls fail with
    /// [`Error::PoolClosed`].
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.semaphore.close();
        let drained: Vec<Connection> = std::mem::take(&mut *self.inner.idle.lock());
        let count = drained.len();
        drop(drained);
        debug!(path = %self.inner.path.display(), connections = count, "pool closed");
    }

    fn release(&self, conn: Connection) {
        if !self.is_closed() {
            self.inner.idle.lock().push(conn);
        }
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("path", &self.inner.path)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Run a query on a borrowed connection and collect every row.
pub(crate) fn query_rows(conn: &Connection, sql: &str, params: &[Value]) -> Result<QueryRows> {
    let mut stmt = conn.prepare(sql)?;
    let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
    let width = columns.len();
    let mut rows = stmt.query(rusqlite::params_from_iter(params.iter()))?;

    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut values = Vec::with_capacity(width);
        for idx in 0..width {
            values.push(row.get::<_, Value>(idx)?);
        }
        out.push(values);
    }

    Ok(QueryRows { columns, rows: out })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_pool(dir: &tempfile::TempDir, config: PoolConfig) -> ConnectionPool {
        ConnectionPool::open(dir.path().join("test.db"), config).unwrap()
    }

    #[tokio::test]
    async fn test_query_and_execute() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_pool(&dir, PoolConfig::default());

        pool.execute_batch("CREATE TABLE user (id INTEGER PRIMARY KEY, name TEXT NOT NULL);")
            .await
            .unwrap();
        let changed = pool
            .execute(
                "INSERT INTO user (id, name) VALUES (?1, ?2)",
                vec![Value::Integer(1), Value::Text("ada".to_string())],
            )
            .await
            .unwrap();
        assert_eq!(changed, 1);

        let rows = pool.query("SELECT id, name FROM user", vec![]).await.unwrap();
        assert_eq!(rows.columns, vec!["id", "name"]);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows.get(0, "name"), Some(&Value::Text("ada".to_string())));
        assert_eq!(rows.scalar_i64(), Some(1));
    }

    #[tokio::test]
    async fn test_connections_are_reused() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_pool(&dir, PoolConfig::default().with_max_connections(2));

        for _ in 0..5 {
            pool.query("SELECT 1", vec![]).await.unwrap();
        }
        assert_eq!(pool.idle_connections(), 1);
    }

    #[tokio::test]
    async fn test_closed_pool_rejects_work() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_pool(&dir, PoolConfig::default());

        pool.close();
        assert!(pool.is_closed());
        assert_eq!(pool.idle_connections(), 0);

        let result = pool.query("SELECT 1", vec![]).await;
        assert!(matches!(result, Err(Error::PoolClosed { .. })));
    }

    #[tokio::test]
    async fn test_statement_timeout_interrupts() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_pool(
            &dir,
            PoolConfig::default().with_statement_timeout(Duration::from_millis(100)),
        );

        let runaway = "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c) \
                       SELECT count(*) FROM c";
        let result = pool.query(runaway, vec![]).await;
        assert!(matches!(result, Err(Error::StatementTimeout { .. })));

        // The interrupted connection goes back to the pool and still works.
        let rows = pool.query("SELECT 42", vec![]).await.unwrap();
        assert_eq!(rows.scalar_i64(), Some(42));
    }

    #[tokio::test]
    async fn test_sql_error_surfaces() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_pool(&dir, PoolConfig::default());

        let result = pool.execute_batch("CREATE TABEL nope (id INTEGER);").await;
        assert!(matches!(result, Err(Error::Sqlite(_))));
    }
}
