//! Migration planning.
//!
//! Computes which migrations are pending against a ledger, checks their
//! dependencies, and works out the order in which applied migrations must be
//! undone to reach a target version.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use serde::Serialize;

use super::definition::{Migration, MigrationCategory, RiskLevel};
use super::error::MigrationError;
use super::ledger::LedgerEntry;
use super::store::MigrationStore;

/// Pending migrations against one ledger.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MigrationPlan {
    /// Pending migrations, lowest version first.
    pub migrations: Vec<Migration>,
    /// Number of pending migrations.
    pub total_count: usize,
    /// Sum of declared execution times.
    #[serde(rename = "estimated_time_ms", serialize_with = "serialize_millis")]
    pub estimated_time: Duration,
    /// One message per unmet dependency or duplicated version. Non-empty
    /// blocks execution.
    pub dependencies: Vec<String>,
    /// Whether every pending migration defines rollback SQL.
    pub can_rollback: bool,
    /// Advisory notes, e.g. high-risk migrations.
    pub warnings: Vec<String>,
}

impl MigrationPlan {
    /// Check if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }

    /// Check whether planning found unmet dependencies.
    pub fn has_unmet_dependencies(&self) -> bool {
        !self.dependencies.is_empty()
    }

    /// Highest version in the plan.
    pub fn target_version(&self) -> Option<i64> {
        self.migrations.iter().map(|m| m.version).max()
    }
}

/// Applied migrations to undo, most recent first.
#[derive(Debug, Clone, Serialize)]
pub struct RollbackPlan {
    /// Version the schema ends up at.
    pub target_version: i64,
    /// Version before rolling back.
    pub current_version: i64,
    /// Migrations to roll back, most recent first.
    pub migrations: Vec<Migration>,
    /// Advisory risk messages. Non-empty blocks an unforced rollback.
    pub risky_operations: Vec<String>,
}

impl RollbackPlan {
    /// Check whether any risky operation was flagged.
    pub fn is_risky(&self) -> bool {
        !self.risky_operations.is_empty()
    }

    /// Check if nothing would be rolled back.
    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }
}

/// Plans migrations and rollbacks against a definition store.
pub struct MigrationPlanner<'a> {
    store: &'a MigrationStore,
}

impl<'a> MigrationPlanner<'a> {
    /// Create a planner over `store`.
    pub fn new(store: &'a MigrationStore) -> Self {
        Self { store }
    }

    /// Plan every migration whose version is not in `applied`.
    ///
    /// A dependency counts as met when it is applied or when it is pending
    /// and scheduled earlier in this plan. Every unmet dependency produces a
    /// message; planning never stops at the first problem.
    pub fn create_plan(&self, applied: &BTreeSet<i64>) -> MigrationPlan {
        let pending: Vec<Migration> = self
            .store
            .all_migrations()
            .iter()
            .filter(|m| !applied.contains(&m.version))
            .cloned()
            .collect();

        let mut dependencies = Vec::new();
        let mut warnings = Vec::new();
        let mut scheduled = BTreeSet::new();

        for migration in &pending {
            for dep in &migration.dependencies {
                if applied.contains(dep) || scheduled.contains(dep) {
                    continue;
                }
                let reason = if pending.iter().any(|m| m.version == *dep) {
                    "which is scheduled after it"
                } else {
                    "which is neither applied nor defined"
                };
                dependencies.push(format!(
                    "migration {} (v{}) depends on v{}, {}",
                    migration.id, migration.version, dep, reason
                ));
            }
            if migration.risk_level == RiskLevel::High {
                warnings.push(format!(
                    "migration {} (v{}) is marked high risk",
                    migration.id, migration.version
                ));
            }
            if !migration.can_rollback() {
                warnings.push(format!(
                    "migration {} (v{}) has no rollback SQL",
                    migration.id, migration.version
                ));
            }
            scheduled.insert(migration.version);
        }

        let mut by_version: BTreeMap<i64, Vec<&str>> = BTreeMap::new();
        for migration in &pending {
            by_version.entry(migration.version).or_default().push(&migration.id);
        }
        for (version, ids) in by_version.into_iter().filter(|(_, ids)| ids.len() > 1) {
            dependencies.push(format!("duplicate migration version v{}: {}", version, ids.join(", ")));
        }

        let estimated_time = pending.iter().map(Migration::estimated_time).sum();
        let can_rollback = pending.iter().all(Migration::can_rollback);

        MigrationPlan {
            total_count: pending.len(),
            migrations: pending,
            estimated_time,
            dependencies,
            can_rollback,
            warnings,
        }
    }

    /// Plan a rollback of every ledger entry above `target_version`.
    pub fn create_rollback_plan(
        &self,
        target_version: i64,
        ledger: &[LedgerEntry],
    ) -> Result<RollbackPlan, MigrationError> {
        let current_version = ledger.iter().map(|e| e.version).max().unwrap_or(0);
        if target_version < 0 || target_version >= current_version {
            return Err(MigrationError::InvalidRollbackTarget {
                target: target_version,
                current: current_version,
            });
        }

        let mut selected: Vec<&LedgerEntry> =
            ledger.iter().filter(|e| e.version > target_version).collect();
        selected.sort_by(|a, b| b.version.cmp(&a.version));

        let mut migrations = Vec::with_capacity(selected.len());
        let mut risky_operations = Vec::new();

        for entry in selected {
            let migration = match self.store.by_id(&entry.migration_id) {
                Some(defined) => defined.clone(),
                None => {
                    risky_operations.push(format!(
                        "migration {} (v{}) is no longer defined; using rollback SQL recorded in the ledger",
                        entry.migration_id, entry.version
                    ));
                    entry.to_migration()
                }
            };

            if !migration.can_rollback() {
                risky_operations.push(format!(
                    "migration {} (v{}) has no rollback SQL",
                    migration.id, migration.version
                ));
            }
            if migration.category == MigrationCategory::Data {
                risky_operations.push(format!(
                    "migration {} (v{}) changes data; rolling it back may lose data",
                    migration.id, migration.version
                ));
            }
            migrations.push(migration);
        }

        Ok(RollbackPlan {
            target_version,
            current_version,
            migrations,
            risky_operations,
        })
    }
}

fn serialize_millis<S: serde::Serializer>(duration: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(duration.as_millis() as u64)
}
