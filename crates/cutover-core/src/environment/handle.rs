//! A single named environment: one database file and its connection pool.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::migration::ledger::{self, LEDGER_TABLE};
use crate::pool::{ConnectionPool, PoolConfig};

/// Sidecar files SQLite may create next to a database file.
const SIDECAR_SUFFIXES: [&str; 3] = ["-wal", "-shm", "-journal"];

/// Identity of an environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvironmentName {
    /// The blue side.
    Blue,
    /// The green side.
    Green,
}

impl EnvironmentName {
    /// Both names, blue first.
    pub const ALL: [EnvironmentName; 2] = [EnvironmentName::Blue, EnvironmentName::Green];

    /// The opposite side.
    pub fn other(self) -> Self {
        match self {
            EnvironmentName::Blue => EnvironmentName::Green,
            EnvironmentName::Green => EnvironmentName::Blue,
        }
    }

    /// Lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            EnvironmentName::Blue => "blue",
            EnvironmentName::Green => "green",
        }
    }

    /// File name of this environment inside the data directory.
    pub fn file_name(self) -> String {
        format!("{}.db", self.as_str())
    }
}

impl std::fmt::Display for EnvironmentName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EnvironmentName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "blue" => Ok(EnvironmentName::Blue),
            "green" => Ok(EnvironmentName::Green),
            other => Err(Error::InvalidData(format!("unknown environment {:?}", other))),
        }
    }
}

/// Result of the last health probe.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// The last probe succeeded.
    Healthy,
    /// The last probe failed.
    Unhealthy,
    /// Not probed yet.
    #[default]
    Unknown,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
            HealthStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// Point-in-time view of an environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnvironmentStatus {
    /// Environment name.
    pub name: EnvironmentName,
    /// Whether it serves traffic.
    pub active: bool,
    /// Highest applied migration version.
    pub schema_version: i64,
    /// Last probe result.
    pub health: HealthStatus,
    /// Database file.
    pub path: String,
    /// When the environment was created.
    pub created_at: DateTime<Utc>,
}

/// One named environment.
///
/// Environments are shared as `Arc<Environment>`; the active flag and the
/// cached schema version are atomics so a snapshot never needs a lock on
/// the environment itself.
pub struct Environment {
    name: EnvironmentName,
    path: PathBuf,
    pool: ConnectionPool,
    is_active: AtomicBool,
    schema_version: AtomicI64,
    health: Mutex<HealthStatus>,
    created_at: DateTime<Utc>,
}

impl Environment {
    /// Path of the database file for `name` inside `data_dir`.
    pub fn file_path(data_dir: &Path, name: EnvironmentName) -> PathBuf {
        data_dir.join(name.file_name())
    }

    /// Create a fresh, empty environment, discarding any file left at its path.
    pub fn create(data_dir: &Path, name: EnvironmentName, pool_config: PoolConfig) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let path = Self::file_path(data_dir, name);
        remove_database_files(&path)?;

        let pool = ConnectionPool::open(&path, pool_config)?;
        info!(environment = %name, path = %path.display(), "created environment");
        Ok(Self::with_pool(name, path, pool, Utc::now()))
    }

    /// Open the environment already on disk.
    pub fn open_existing(data_dir: &Path, name: EnvironmentName, pool_config: PoolConfig) -> Result<Self> {
        let path = Self::file_path(data_dir, name);
        let metadata = std::fs::metadata(&path)?;
        let created_at = metadata
            .created()
            .or_else(|_| metadata.modified())
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());

        let pool = ConnectionPool::open(&path, pool_config)?;
        debug!(environment = %name, path = %path.display(), "opened environment");
        Ok(Self::with_pool(name, path, pool, created_at))
    }

    fn with_pool(name: EnvironmentName, path: PathBuf, pool: ConnectionPool, created_at: DateTime<Utc>) -> Self {
        Self {
            name,
            path,
            pool,
            is_active: AtomicBool::new(false),
            schema_version: AtomicI64::new(0),
            health: Mutex::new(HealthStatus::Unknown),
            created_at,
        }
    }

    /// Environment name.
    pub fn name(&self) -> EnvironmentName {
        self.name
    }

    /// Database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Connection pool for this environment.
    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Whether this environment serves traffic.
    pub fn is_active(&self) -> bool {
        self.is_active.load(Ordering::SeqCst)
    }

    pub(crate) fn set_active(&self, active: bool) {
        self.is_active.store(active, Ordering::SeqCst);
    }

    /// Cached schema version, see [`Environment::refresh_schema_version`].
    pub fn schema_version(&self) -> i64 {
        self.schema_version.load(Ordering::SeqCst)
    }

    /// Last probe result.
    pub fn health(&self) -> HealthStatus {
        *self.health.lock()
    }

    /// When the environment was created.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Run the base schema script, if any.
    pub async fn materialize_schema(&self, schema_sql: Option<String>) -> Result<()> {
        let Some(sql) = schema_sql.filter(|s| !s.trim().is_empty()) else {
            debug!(environment = %self.name, "no base schema to materialize");
            return Ok(());
        };
        self.pool.execute_batch(sql).await?;
        info!(environment = %self.name, "base schema materialized");
        Ok(())
    }

    /// Run `SELECT 1` and record the result.
    pub async fn probe(&self) -> HealthStatus {
        let status = match self.pool.query("SELECT 1", Vec::new()).await {
            Ok(rows) if rows.scalar_i64() == Some(1) => HealthStatus::Healthy,
            Ok(_) => HealthStatus::Unhealthy,
            Err(e) => {
                warn!(environment = %self.name, error = %e, "health probe failed");
                HealthStatus::Unhealthy
            }
        };
        *self.health.lock() = status;
        status
    }

    /// Re-read the schema version from the ledger.
    ///
    /// An environment without a ledger table is at version 0.
    pub async fn refresh_schema_version(&self) -> Result<i64> {
        let version = self
            .pool
            .with_connection(|conn| {
                let has_ledger: bool = conn.query_row(
                    "SELECT EXISTS (SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
                    [LEDGER_TABLE],
                    |row| row.get(0),
                )?;
                if has_ledger {
                    ledger::current_version(conn)
                } else {
                    Ok(0)
                }
            })
            .await?;
        self.schema_version.store(version, Ordering::SeqCst);
        Ok(version)
    }

    /// Close the pool and delete the database file with its sidecars.
    pub fn teardown(&self) -> Result<()> {
        self.pool.close();
        self.set_active(false);
        *self.health.lock() = HealthStatus::Unknown;
        remove_database_files(&self.path)?;
        info!(environment = %self.name, path = %self.path.display(), "environment torn down");
        Ok(())
    }

    /// Snapshot of this environment.
    pub fn status(&self) -> EnvironmentStatus {
        EnvironmentStatus {
            name: self.name,
            active: self.is_active(),
            schema_version: self.schema_version(),
            health: self.health(),
            path: self.path.display().to_string(),
            created_at: self.created_at,
        }
    }
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("active", &self.is_active())
            .field("schema_version", &self.schema_version())
            .finish()
    }
}

/// Delete a database file and its sidecars, ignoring files that are absent.
pub(crate) fn remove_database_files(path: &Path) -> Result<()> {
    let mut candidates = vec![path.to_path_buf()];
    for suffix in SIDECAR_SUFFIXES {
        let mut name = path.as_os_str().to_owned();
        name.push(suffix);
        candidates.push(PathBuf::from(name));
    }

    for candidate in candidates {
        match std::fs::remove_file(&candidate) {
            Ok(()) => debug!(path = %candidate.display(), "removed file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}
