//! Orchestrator configuration.

use std::path::PathBuf;
use std::time::Duration;

use super::error::DeployError;
use crate::migration::MigrationConfig;
use crate::pool::PoolConfig;

/// Default time the previous environment is kept after a switch.
pub const DEFAULT_ROLLBACK_WINDOW: Duration = Duration::from_secs(5 * 60);

/// Where the base schema comes from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SchemaSource {
    /// No base schema; environments start empty.
    #[default]
    None,
    /// SQL given directly.
    Inline(String),
    /// SQL read from a file each time an environment is prepared.
    File(PathBuf),
}

impl SchemaSource {
    /// Resolve the schema SQL. Blank SQL counts as no schema.
    pub fn load(&self) -> Result<Option<String>, DeployError> {
        let sql = match self {
            SchemaSource::None => return Ok(None),
            SchemaSource::Inline(sql) => sql.clone(),
            SchemaSource::File(path) => {
                std::fs::read_to_string(path).map_err(|source| DeployError::SchemaFile {
                    path: path.display().to_string(),
                    source,
                })?
            }
        };
        Ok(Some(sql).filter(|s| !s.trim().is_empty()))
    }
}

/// Blue-green orchestrator configuration.
#[derive(Debug, Clone)]
pub struct DeployConfig {
    /// Directory holding `blue.db`, `green.db` and the registry state.
    pub data_dir: PathBuf,

    /// Base schema materialized into every new environment.
    pub schema: SchemaSource,

    /// Tables whose row counts are checked before a switch.
    pub core_tables: Vec<String>,

    /// How long the previous environment is kept for instant rollback.
    pub rollback_window: Duration,

    /// Connection pool settings for each environment.
    pub pool: PoolConfig,

    /// Migration executor settings.
    pub migration: MigrationConfig,
}

impl DeployConfig {
    /// Create a configuration for the given data directory.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            schema: SchemaSource::None,
            core_tables: Vec::new(),
            rollback_window: DEFAULT_ROLLBACK_WINDOW,
            pool: PoolConfig::default(),
            migration: MigrationConfig::default(),
        }
    }

    /// Use inline base schema SQL.
    pub fn with_schema_sql(mut self, sql: impl Into<String>) -> Self {
        self.schema = SchemaSource::Inline(sql.into());
        self
    }

    /// Read the base schema from a file.
    pub fn with_schema_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.schema = SchemaSource::File(path.into());
        self
    }

    /// Set the tables checked during validation.
    pub fn with_core_tables<I, S>(mut self, tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.core_tables = tables.into_iter().map(Into::into).collect();
        self
    }

    /// Set the rollback window.
    pub fn with_rollback_window(mut self, window: Duration) -> Self {
        self.rollback_window = window;
        self
    }

    /// Set the pool configuration.
    pub fn with_pool_config(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    /// Set the per-statement timeout.
    pub fn with_statement_timeout(mut self, timeout: Duration) -> Self {
        self.pool = self.pool.with_statement_timeout(timeout);
        self
    }

    /// Set the migration configuration.
    pub fn with_migration_config(mut self, migration: MigrationConfig) -> Self {
        self.migration = migration;
        self
    }
}
