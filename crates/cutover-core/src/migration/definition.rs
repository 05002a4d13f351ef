//! Migration definitions.
//!
//! A migration is an immutable, versioned unit of forward SQL with optional
//! rollback SQL. Its checksum covers every field that affects what it does
//! or how it is described, so any edit made after it was applied shows up as
//! drift against the ledger.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::MigrationError;
use crate::sql::split_statements;

/// Estimated execution time assumed when a migration declares none.
pub const DEFAULT_ESTIMATED_TIME_MS: u64 = 1000;

/// What a migration changes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationCategory {
    /// DDL: tables, columns, views.
    #[default]
    Schema,
    /// Row-level data changes. Rolling these back can lose data.
    Data,
    /// Index creation or removal.
    Index,
}

impl MigrationCategory {
    /// Stable lowercase name, as stored in the ledger.
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationCategory::Schema => "schema",
            MigrationCategory::Data => "data",
            MigrationCategory::Index => "index",
        }
    }

    /// Parse a stored category name.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "schema" => Some(MigrationCategory::Schema),
            "data" => Some(MigrationCategory::Data),
            "index" => Some(MigrationCategory::Index),
            _ => None,
        }
    }
}

impl std::fmt::Display for MigrationCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declared risk of running a migration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    /// Additive, cheap to undo.
    #[default]
    Low,
    /// Touches existing structures.
    Medium,
    /// Destructive or long-running.
    High,
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RiskLevel::Low => write!(f, "low"),
            RiskLevel::Medium => write!(f, "medium"),
            RiskLevel::High => write!(f, "high"),
        }
    }
}

/// A versioned migration unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Migration {
    /// Unique id, e.g. `0003_add_event_capacity`.
    pub id: String,
    /// Monotonically increasing version.
    pub version: i64,
    /// Short human name.
    pub name: String,
    /// Longer description.
    #[serde(default)]
    pub description: String,
    /// What the migration changes.
    #[serde(default)]
    pub category: MigrationCategory,
    /// SQL applied when migrating forward.
    pub forward_sql: String,
    /// SQL that undoes `forward_sql`, if the migration can be rolled back.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_sql: Option<String>,
    /// Versions that must be applied first.
    #[serde(default)]
    pub dependencies: Vec<i64>,
    /// Declared risk.
    #[serde(default)]
    pub risk_level: RiskLevel,
    /// Declared execution time in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_time_ms: Option<u64>,
}

impl Migration {
    /// Create a schema migration with no rollback and no dependencies.
    pub fn new(
        id: impl Into<String>,
        version: i64,
        name: impl Into<String>,
        forward_sql: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            version,
            name: name.into(),
            description: String::new(),
            category: MigrationCategory::Schema,
            forward_sql: forward_sql.into(),
            rollback_sql: None,
            dependencies: Vec::new(),
            risk_level: RiskLevel::Low,
            estimated_time_ms: None,
        }
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set the category.
    pub fn with_category(mut self, category: MigrationCategory) -> Self {
        self.category = category;
        self
    }

    /// Set the rollback SQL.
    pub fn with_rollback(mut self, sql: impl Into<String>) -> Self {
        self.rollback_sql = Some(sql.into());
        self
    }

    /// Add a dependency on another version.
    pub fn depends_on(mut self, version: i64) -> Self {
        self.dependencies.push(version);
        self
    }

    /// Set the risk level.
    pub fn with_risk(mut self, risk: RiskLevel) -> Self {
        self.risk_level = risk;
        self
    }

    /// Set the estimated execution time.
    pub fn with_estimated_time(mut self, duration: Duration) -> Self {
        self.estimated_time_ms = Some(duration.as_millis() as u64);
        self
    }

    /// Check whether the migration defines rollback SQL.
    pub fn can_rollback(&self) -> bool {
        self.rollback_sql
            .as_deref()
            .is_some_and(|sql| !sql.trim().is_empty())
    }

    /// Declared execution time, or the default.
    pub fn estimated_time(&self) -> Duration {
        Duration::from_millis(self.estimated_time_ms.unwrap_or(DEFAULT_ESTIMATED_TIME_MS))
    }

    /// Content checksum (BLAKE3, hex).
    ///
    /// Fields are length-prefixed so that moving text between adjacent
    /// fields changes the digest.
    pub fn checksum(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        let version = self.version.to_string();
        let fields: [&str; 7] = [
            self.id.as_str(),
            version.as_str(),
            self.name.as_str(),
            self.description.as_str(),
            self.category.as_str(),
            self.forward_sql.as_str(),
            self.rollback_sql.as_deref().unwrap_or(""),
        ];
        for field in fields {
            hasher.update(&(field.len() as u64).to_le_bytes());
            hasher.update(field.as_bytes());
        }
        hex::encode(hasher.finalize().as_bytes())
    }

    /// Validate the definition.
    pub fn validate(&self) -> Result<(), MigrationError> {
        let invalid = |reason: String| MigrationError::InvalidDefinition {
            id: self.id.clone(),
            reason,
        };

        if self.id.trim().is_empty() {
            return Err(invalid("id must not be empty".to_string()));
        }
        if self.version <= 0 {
            return Err(invalid(format!("version must be positive, got {}", self.version)));
        }
        if self.name.trim().is_empty() {
            return Err(invalid("name must not be empty".to_string()));
        }

        split_statements(&self.forward_sql).map_err(|e| invalid(format!("forward SQL: {}", e)))?;
        if let Some(rollback) = &self.rollback_sql {
            split_statements(rollback).map_err(|e| invalid(format!("rollback SQL: {}", e)))?;
        }

        for dep in &self.dependencies {
            if *dep <= 0 {
                return Err(invalid(format!("dependency v{} is not a valid version", dep)));
            }
            if *dep >= self.version {
                return Err(invalid(format!(
                    "dependency v{} must be lower than its own version v{}",
                    dep, self.version
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Migration {
        Migration::new("0001_users", 1, "users", "CREATE TABLE users (id INTEGER PRIMARY KEY);")
            .with_description("Create users table")
            .with_rollback("DROP TABLE users;")
    }

    #[test]
    fn test_risk_ordering() {
        assert!(RiskLevel::Low < RiskLevel::Medium);
        assert!(RiskLevel::Medium < RiskLevel::High);
    }

    #[test]
    fn test_checksum_is_stable() {
        assert_eq!(sample().checksum(), sample().checksum());
        assert_eq!(sample().checksum().len(), 64);
    }

    #[test]
    fn test_checksum_tracks_description() {
        let original = sample();
        let edited = sample().with_description("Create the users table");
        assert_ne!(original.checksum(), edited.checksum());
    }

    #[test]
    fn test_checksum_ignores_metadata() {
        let original = sample();
        let retimed = sample()
            .with_estimated_time(Duration::from_secs(5))
            .with_risk(RiskLevel::High);
        assert_eq!(original.checksum(), retimed.checksum());
    }

    #[test]
    fn test_can_rollback() {
        assert!(sample().can_rollback());
        assert!(!Migration::new("x", 1, "x", "SELECT 1").can_rollback());
        assert!(!Migration::new("x", 1, "x", "SELECT 1").with_rollback("  ").can_rollback());
    }

    #[test]
    fn test_estimated_time_default() {
        assert_eq!(sample().estimated_time(), Duration::from_millis(DEFAULT_ESTIMATED_TIME_MS));
    }

    #[test]
    fn test_validate() {
        assert!(sample().validate().is_ok());

        let no_id = Migration::new("", 1, "x", "SELECT 1");
        assert!(matches!(no_id.validate(), Err(MigrationError::InvalidDefinition { .. })));

        let zero_version = Migration::new("x", 0, "x", "SELECT 1");
        assert!(zero_version.validate().is_err());

        let empty_sql = Migration::new("x", 1, "x", "  -- nothing\n");
        assert!(empty_sql.validate().is_err());

        let forward_dep = Migration::new("x", 2, "x", "SELECT 1").depends_on(3);
        assert!(forward_dep.validate().is_err());

        let bad_rollback = Migration::new("x", 2, "x", "SELECT 1").with_rollback("SELECT 'oops");
        assert!(bad_rollback.validate().is_err());
    }

    #[test]
    fn test_json_shape() {
        let json = r#"{
            "id": "0002_events",
            "version": 2,
            "name": "events",
            "category": "data",
            "forward_sql": "INSERT INTO events VALUES (1);",
            "dependencies": [1],
            "risk_level": "high"
        }"#;
        let m: Migration = serde_json::from_str(json).unwrap();
        assert_eq!(m.category, MigrationCategory::Data);
        assert_eq!(m.risk_level, RiskLevel::High);
        assert_eq!(m.dependencies, vec![1]);
        assert!(m.rollback_sql.is_none());
        assert!(m.description.is_empty());
    }
}
