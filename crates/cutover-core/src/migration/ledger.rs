//! The applied-migrations ledger.
//!
//! One row per applied migration in the `schema_migrations` table of each
//! environment. The ledger is append-only: a row disappears only when its
//! migration is rolled back. The highest version present is the
//! environment's schema version.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use super::definition::{Migration, MigrationCategory};
use crate::error::{Error, Result};

/// Name of the ledger table.
pub const LEDGER_TABLE: &str = "schema_migrations";

const CREATE_LEDGER_SQL: &str = "
CREATE TABLE IF NOT EXISTS schema_migrations (
    migration_id TEXT PRIMARY KEY,
    version INTEGER NOT NULL UNIQUE,
    name TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    category TEXT NOT NULL,
    checksum TEXT NOT NULL,
    applied_at TEXT NOT NULL,
    execution_time_ms INTEGER NOT NULL,
    applied_by TEXT NOT NULL,
    rollback_sql TEXT,
    can_rollback INTEGER NOT NULL DEFAULT 0
);
";

const SELECT_COLUMNS: &str = "migration_id, version, name, description, category, checksum, \
                              applied_at, execution_time_ms, applied_by, rollback_sql, can_rollback";

/// One applied migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerEntry {
    /// Migration id.
    pub migration_id: String,
    /// Migration version.
    pub version: i64,
    /// Migration name.
    pub name: String,
    /// Migration description at apply time.
    pub description: String,
    /// Migration category.
    pub category: MigrationCategory,
    /// Checksum recorded at apply time.
    pub checksum: String,
    /// When the migration was applied.
    pub applied_at: DateTime<Utc>,
    /// How long the forward SQL took.
    pub execution_time_ms: u64,
    /// Who applied it.
    pub applied_by: String,
    /// Rollback SQL captured at apply time.
    pub rollback_sql: Option<String>,
    /// Whether the migration could be rolled back when applied.
    pub can_rollback: bool,
}

impl LedgerEntry {
    /// Build the entry recorded for `migration`.
    pub fn for_migration(
        migration: &Migration,
        execution_time_ms: u64,
        applied_by: impl Into<String>,
    ) -> Self {
        Self {
            migration_id: migration.id.clone(),
            version: migration.version,
            name: migration.name.clone(),
            description: migration.description.clone(),
            category: migration.category,
            checksum: migration.checksum(),
            applied_at: Utc::now(),
            execution_time_ms,
            applied_by: applied_by.into(),
            rollback_sql: migration.rollback_sql.clone(),
            can_rollback: migration.can_rollback(),
        }
    }

    /// Rebuild a migration from what the ledger recorded.
    ///
    /// Only used to roll back a migration whose definition is no longer
    /// loaded; the forward SQL is not stored and comes back empty.
    pub fn to_migration(&self) -> Migration {
        Migration {
            id: self.migration_id.clone(),
            version: self.version,
            name: self.name.clone(),
            description: self.description.clone(),
            category: self.category,
            forward_sql: String::new(),
            rollback_sql: self.rollback_sql.clone(),
            dependencies: Vec::new(),
            risk_level: Default::default(),
            estimated_time_ms: None,
        }
    }

    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        let category: String = row.get(4)?;
        let applied_at: String = row.get(6)?;
        let execution_time_ms: i64 = row.get(7)?;
        let can_rollback: i64 = row.get(10)?;

        let category = MigrationCategory::parse(&category).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                4,
                rusqlite::types::Type::Text,
                format!("unknown migration category {:?}", category).into(),
            )
        })?;
        let applied_at = DateTime::parse_from_rfc3339(&applied_at)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, Box::new(e))
            })?;

        Ok(Self {
            migration_id: row.get(0)?,
            version: row.get(1)?,
            name: row.get(2)?,
            description: row.get(3)?,
            category,
            checksum: row.get(5)?,
            applied_at,
            execution_time_ms: execution_time_ms.max(0) as u64,
            applied_by: row.get(8)?,
            rollback_sql: row.get(9)?,
            can_rollback: can_rollback != 0,
        })
    }
}

/// Create the ledger table if it does not exist.
pub fn ensure_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(CREATE_LEDGER_SQL)?;
    Ok(())
}

/// All ledger entries, lowest version first.
pub fn entries(conn: &Connection) -> Result<Vec<LedgerEntry>> {
    let sql = format!("SELECT {} FROM {} ORDER BY version ASC", SELECT_COLUMNS, LEDGER_TABLE);
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], LedgerEntry::from_row)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

/// Look up the entry for a migration id.
pub fn find(conn: &Connection, migration_id: &str) -> Result<Option<LedgerEntry>> {
    let sql = format!("SELECT {} FROM {} WHERE migration_id = ?1", SELECT_COLUMNS, LEDGER_TABLE);
    let entry = conn
        .query_row(&sql, params![migration_id], LedgerEntry::from_row)
        .optional()?;
    Ok(entry)
}

/// Highest applied version, or 0 when nothing is applied.
pub fn current_version(conn: &Connection) -> Result<i64> {
    let sql = format!("SELECT COALESCE(MAX(version), 0) FROM {}", LEDGER_TABLE);
    let version = conn.query_row(&sql, [], |row| row.get(0))?;
    Ok(version)
}

/// Check whether a version has a ledger row.
pub fn is_applied(conn: &Connection, version: i64) -> Result<bool> {
    let sql = format!("SELECT 1 FROM {} WHERE version = ?1", LEDGER_TABLE);
    let found = conn
        .query_row(&sql, params![version], |_| Ok(()))
        .optional()?;
    Ok(found.is_some())
}

/// Append an entry.
///
/// Fails if the id or the version is already present.
pub fn insert(conn: &Connection, entry: &LedgerEntry) -> Result<()> {
    let sql = format!(
        "INSERT INTO {} ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        LEDGER_TABLE, SELECT_COLUMNS
    );
    conn.execute(
        &sql,
        params![
            entry.migration_id,
            entry.version,
            entry.name,
            entry.description,
            entry.category.as_str(),
            entry.checksum,
            entry.applied_at.to_rfc3339(),
            entry.execution_time_ms as i64,
            entry.applied_by,
            entry.rollback_sql,
            entry.can_rollback as i64,
        ],
    )?;
    Ok(())
}

/// Remove the entry for a rolled-back migration.
pub fn remove(conn: &Connection, migration_id: &str) -> Result<()> {
    let sql = format!("DELETE FROM {} WHERE migration_id = ?1", LEDGER_TABLE);
    let removed = conn.execute(&sql, params![migration_id])?;
    if removed == 0 {
        return Err(Error::InvalidData(format!(
            "no ledger entry for migration {}",
            migration_id
        )));
    }
    Ok(())
}
