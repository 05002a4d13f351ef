//! Migration executor - applies and rolls back migrations on one environment.
//!
//! Each migration runs inside a single transaction together with its ledger
//! write, so a failed migration leaves neither schema changes nor a ledger
//! row behind. Failures are reported in the returned outcome and never
//! retried.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::definition::Migration;
use super::error::MigrationError;
use super::integrity::{self, IntegrityIssue};
use super::ledger::{self, LedgerEntry};
use super::plan::{MigrationPlan, MigrationPlanner, RollbackPlan};
use super::store::MigrationStore;
use crate::pool::ConnectionPool;

/// Identity recorded in the ledger when none is configured.
pub const DEFAULT_APPLIED_BY: &str = "cutover";

/// Migration executor configuration.
#[derive(Debug, Clone)]
pub struct MigrationConfig {
    /// Identity recorded as the applier of each migration.
    pub applied_by: String,
    /// Whether to run in dry-run mode (no actual changes).
    pub dry_run: bool,
}

impl MigrationConfig {
    /// Set the applier identity.
    pub fn with_applied_by(mut self, applied_by: impl Into<String>) -> Self {
        self.applied_by = applied_by.into();
        self
    }

    /// Enable or disable dry-run mode.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            applied_by: DEFAULT_APPLIED_BY.to_string(),
            dry_run: false,
        }
    }
}

/// Result of running (or rolling back) one migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationOutcome {
    /// Migration id.
    pub migration_id: String,
    /// Migration version.
    pub version: i64,
    /// Migration name.
    pub name: String,
    /// Whether the SQL and the ledger write committed.
    pub success: bool,
    /// Wall time spent, in milliseconds.
    pub execution_time_ms: u64,
    /// Whether the migration can be rolled back.
    pub can_rollback: bool,
    /// Error message when `success` is false.
    pub error: Option<String>,
    /// Set when nothing was executed.
    pub dry_run: bool,
}

impl MigrationOutcome {
    fn new(migration: &Migration, execution_time_ms: u64, error: Option<String>) -> Self {
        Self {
            migration_id: migration.id.clone(),
            version: migration.version,
            name: migration.name.clone(),
            success: error.is_none(),
            execution_time_ms,
            can_rollback: migration.can_rollback(),
            error,
            dry_run: false,
        }
    }

    fn planned(migration: &Migration) -> Self {
        Self {
            dry_run: true,
            ..Self::new(migration, 0, None)
        }
    }
}

/// Migration state of one environment.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationStatusReport {
    /// Highest applied version.
    pub current_version: i64,
    /// Number of ledger rows.
    pub applied_count: usize,
    /// Number of loaded migrations not yet applied.
    pub pending_count: usize,
    /// Every ledger row, lowest version first.
    pub applied: Vec<LedgerEntry>,
    /// Pending migrations, lowest version first.
    pub pending: Vec<Migration>,
    /// Most recently applied migration.
    pub last_applied: Option<LedgerEntry>,
}

/// Applies migrations from a store to the environment behind one pool.
#[derive(Debug, Clone)]
pub struct MigrationExecutor {
    pool: ConnectionPool,
    store: Arc<MigrationStore>,
    config: MigrationConfig,
}

impl MigrationExecutor {
    /// Create an executor bound to `pool`.
    pub fn new(pool: ConnectionPool, store: Arc<MigrationStore>, config: MigrationConfig) -> Self {
        Self { pool, store, config }
    }

    /// The pool this executor writes through.
    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// The definition store.
    pub fn store(&self) -> &Arc<MigrationStore> {
        &self.store
    }

    /// Executor configuration.
    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    /// Create the ledger table if it is missing.
    pub async fn initialize(&self) -> Result<(), MigrationError> {
        self.pool.with_connection(|conn| ledger::ensure_table(conn)).await?;
        debug!(path = %self.pool.path().display(), "migration ledger ready");
        Ok(())
    }

    /// Every ledger row, lowest version first.
    pub async fn ledger(&self) -> Result<Vec<LedgerEntry>, MigrationError> {
        Ok(self.pool.with_connection(|conn| ledger::entries(conn)).await?)
    }

    /// Versions with a ledger row.
    pub async fn applied_versions(&self) -> Result<BTreeSet<i64>, MigrationError> {
        Ok(self.ledger().await?.iter().map(|e| e.version).collect())
    }

    /// Highest applied version, or 0.
    pub async fn current_version(&self) -> Result<i64, MigrationError> {
        Ok(self
            .pool
            .with_connection(|conn| ledger::current_version(conn))
            .await?)
    }

    /// Plan every loaded migration this environment has not applied.
    pub async fn create_migration_plan(&self) -> Result<MigrationPlan, MigrationError> {
        let applied = self.applied_versions().await?;
        Ok(MigrationPlanner::new(&self.store).create_plan(&applied))
    }

    /// Plan a rollback of this environment to `target_version`.
    pub async fn create_rollback_plan(&self, target_version: i64) -> Result<RollbackPlan, MigrationError> {
        let entries = self.ledger().await?;
        MigrationPlanner::new(&self.store).create_rollback_plan(target_version, &entries)
    }

    /// Apply one migration.
    ///
    /// Every dependency must already have a ledger row. The forward SQL and
    /// the ledger insert commit together; a failure is returned as an
    /// unsuccessful outcome.
    pub async fn execute_migration(&self, migration: &Migration) -> Result<MigrationOutcome, MigrationError> {
        let dependencies = migration.dependencies.clone();
        let missing = self
            .pool
            .with_connection(move |conn| {
                for dep in dependencies {
                    if !ledger::is_applied(conn, dep)? {
                        return Ok(Some(dep));
                    }
                }
                Ok(None)
            })
            .await?;
        if let Some(dependency) = missing {
            return Err(MigrationError::DependencyNotApplied {
                id: migration.id.clone(),
                version: migration.version,
                dependency,
            });
        }

        if self.config.dry_run {
            return Ok(MigrationOutcome::planned(migration));
        }

        info!(migration = %migration.id, version = migration.version, "applying migration");
        let owned = migration.clone();
        let applied_by = self.config.applied_by.clone();
        let started = Instant::now();
        let result = self
            .pool
            .with_connection(move |conn| {
                let tx = conn.transaction()?;
                tx.execute_batch(&owned.forward_sql)?;
                let elapsed = started.elapsed().as_millis() as u64;
                ledger::insert(&tx, &LedgerEntry::for_migration(&owned, elapsed, applied_by))?;
                tx.commit()?;
                Ok(elapsed)
            })
            .await;

        let outcome = match result {
            Ok(elapsed) => {
                info!(
                    migration = %migration.id,
                    version = migration.version,
                    elapsed_ms = elapsed,
                    "migration applied"
                );
                MigrationOutcome::new(migration, elapsed, None)
            }
            Err(e) => {
                let elapsed = started.elapsed().as_millis() as u64;
                error!(migration = %migration.id, version = migration.version, error = %e, "migration failed");
                MigrationOutcome::new(migration, elapsed, Some(e.to_string()))
            }
        };
        Ok(outcome)
    }

    /// Apply every pending migration in version order.
    ///
    /// Unmet dependencies abort before any SQL runs. Execution stops at the
    /// first failed migration; the outcomes so far are returned.
    pub async fn migrate(&self) -> Result<Vec<MigrationOutcome>, MigrationError> {
        let plan = self.create_migration_plan().await?;
        if plan.has_unmet_dependencies() {
            return Err(MigrationError::UnmetDependencies {
                messages: plan.dependencies,
            });
        }
        if self.config.dry_run {
            return Ok(plan.migrations.iter().map(MigrationOutcome::planned).collect());
        }
        self.apply_plan(&plan).await
    }

    /// Apply the migrations of an already computed plan, stopping at the
    /// first failure.
    pub async fn apply_plan(&self, plan: &MigrationPlan) -> Result<Vec<MigrationOutcome>, MigrationError> {
        let mut outcomes = Vec::with_capacity(plan.migrations.len());
        for migration in &plan.migrations {
            let outcome = self.execute_migration(migration).await?;
            let failed = !outcome.success;
            outcomes.push(outcome);
            if failed {
                warn!(
                    migration = %migration.id,
                    remaining = plan.migrations.len() - outcomes.len(),
                    "stopping after failed migration"
                );
                break;
            }
        }
        Ok(outcomes)
    }

    /// What `migrate` would run, without touching the database.
    pub async fn dry_run_migrate(&self) -> Result<MigrationPlan, MigrationError> {
        self.create_migration_plan().await
    }

    /// Roll back one applied migration.
    ///
    /// Missing rollback SQL is an error. The rollback SQL and the ledger
    /// delete commit together.
    pub async fn execute_rollback(&self, migration: &Migration) -> Result<MigrationOutcome, MigrationError> {
        let rollback_sql = match &migration.rollback_sql {
            Some(sql) if migration.can_rollback() => sql.clone(),
            _ => {
                return Err(MigrationError::RollbackUnavailable {
                    id: migration.id.clone(),
                    version: migration.version,
                })
            }
        };

        let id = migration.id.clone();
        let applied = self
            .pool
            .with_connection(move |conn| ledger::find(conn, &id))
            .await?;
        if applied.is_none() {
            return Err(MigrationError::MigrationNotFound {
                id: migration.id.clone(),
            });
        }

        if self.config.dry_run {
            return Ok(MigrationOutcome::planned(migration));
        }

        info!(migration = %migration.id, version = migration.version, "rolling back migration");
        let id = migration.id.clone();
        let started = Instant::now();
        let result = self
            .pool
            .with_connection(move |conn| {
                let tx = conn.transaction()?;
                tx.execute_batch(&rollback_sql)?;
                ledger::remove(&tx, &id)?;
                tx.commit()?;
                Ok(())
            })
            .await;
        let elapsed = started.elapsed().as_millis() as u64;

        let outcome = match result {
            Ok(()) => {
                info!(migration = %migration.id, version = migration.version, elapsed_ms = elapsed, "migration rolled back");
                MigrationOutcome::new(migration, elapsed, None)
            }
            Err(e) => {
                error!(migration = %migration.id, version = migration.version, error = %e, "rollback failed");
                MigrationOutcome::new(migration, elapsed, Some(e.to_string()))
            }
        };
        Ok(outcome)
    }

    /// Roll back to `target_version`, most recent migration first.
    ///
    /// A plan with risky operations is refused unless `force` is set. A
    /// migration without rollback SQL fails the call before anything runs.
    /// Execution stops at the first failure.
    pub async fn rollback(&self, target_version: i64, force: bool) -> Result<Vec<MigrationOutcome>, MigrationError> {
        let plan = self.create_rollback_plan(target_version).await?;
        if plan.is_risky() && !force {
            return Err(MigrationError::RiskyRollback {
                risks: plan.risky_operations,
            });
        }
        if let Some(m) = plan.migrations.iter().find(|m| !m.can_rollback()) {
            return Err(MigrationError::RollbackUnavailable {
                id: m.id.clone(),
                version: m.version,
            });
        }
        if plan.is_risky() {
            warn!(risks = plan.risky_operations.len(), target_version, "forcing risky rollback");
        }

        let mut outcomes = Vec::with_capacity(plan.migrations.len());
        for migration in &plan.migrations {
            let outcome = self.execute_rollback(migration).await?;
            let failed = !outcome.success;
            outcomes.push(outcome);
            if failed {
                break;
            }
        }
        Ok(outcomes)
    }

    /// What `rollback` would undo, without touching the database.
    pub async fn dry_run_rollback(&self, target_version: i64) -> Result<RollbackPlan, MigrationError> {
        self.create_rollback_plan(target_version).await
    }

    /// Summarize this environment's migration state.
    pub async fn get_status(&self) -> Result<MigrationStatusReport, MigrationError> {
        let applied = self.ledger().await?;
        let versions: BTreeSet<i64> = applied.iter().map(|e| e.version).collect();
        let plan = MigrationPlanner::new(&self.store).create_plan(&versions);

        Ok(MigrationStatusReport {
            current_version: applied.last().map(|e| e.version).unwrap_or(0),
            applied_count: applied.len(),
            pending_count: plan.total_count,
            last_applied: applied.last().cloned(),
            applied,
            pending: plan.migrations,
        })
    }

    /// Check loaded definitions against this environment's ledger.
    pub async fn validate_integrity(&self) -> Result<Vec<IntegrityIssue>, MigrationError> {
        let entries = self.ledger().await?;
        let issues = integrity::check(&self.store, &entries);
        if issues.is_empty() {
            debug!(applied = entries.len(), "integrity check passed");
        } else {
            warn!(issues = issues.len(), "integrity check found issues");
        }
        Ok(issues)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::definition::MigrationCategory;
    use crate::pool::PoolConfig;
    use rusqlite::types::Value;
    use std::time::Duration;

    fn migration(version: i64) -> Migration {
        Migration::new(
            format!("{:04}_t{}", version, version),
            version,
            format!("create t{}", version),
            format!("CREATE TABLE t{} (id INTEGER PRIMARY KEY);", version),
        )
        .with_rollback(format!("DROP TABLE t{};", version))
    }

    async fn executor_with(
        dir: &tempfile::TempDir,
        migrations: Vec<Migration>,
        pool_config: PoolConfig,
        config: MigrationConfig,
    ) -> MigrationExecutor {
        let pool = ConnectionPool::open(dir.path().join("env.db"), pool_config).unwrap();
        let store = Arc::new(MigrationStore::from_definitions(migrations));
        let executor = MigrationExecutor::new(pool, store, config);
        executor.initialize().await.unwrap();
        executor
    }

    async fn executor(dir: &tempfile::TempDir, migrations: Vec<Migration>) -> MigrationExecutor {
        executor_with(dir, migrations, PoolConfig::default(), MigrationConfig::default()).await
    }

    async fn table_exists(executor: &MigrationExecutor, name: &str) -> bool {
        let rows = executor
            .pool()
            .query(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
                vec![Value::Text(name.to_string())],
            )
            .await
            .unwrap();
        !rows.is_empty()
    }

    #[tokio::test]
    async fn test_migrate_applies_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(&dir, vec![migration(2).depends_on(1), migration(1), migration(3)]).await;

        let outcomes = exec.migrate().await.unwrap();
        let versions: Vec<i64> = outcomes.iter().map(|o| o.version).collect();
        assert_eq!(versions, vec![1, 2, 3]);
        assert!(outcomes.iter().all(|o| o.success && o.can_rollback));
        assert_eq!(exec.current_version().await.unwrap(), 3);
        assert!(table_exists(&exec, "t2").await);
    }

    #[tokio::test]
    async fn test_migrate_twice_changes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(&dir, vec![migration(1), migration(2)]).await;

        exec.migrate().await.unwrap();
        let before = exec.ledger().await.unwrap();

        assert!(exec.migrate().await.unwrap().is_empty());
        assert!(exec.migrate().await.unwrap().is_empty());
        assert_eq!(exec.ledger().await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_failed_migration_stops_and_leaves_no_row() {
        let dir = tempfile::tempdir().unwrap();
        let broken = Migration::new(
            "0002_broken",
            2,
            "broken",
            "CREATE TABLE ok2 (id INTEGER); CREATE TABEL nope (id INTEGER);",
        );
        let exec = executor(&dir, vec![migration(1), broken, migration(3)]).await;

        let outcomes = exec.migrate().await.unwrap();
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes[0].success);
        assert!(!outcomes[1].success);
        assert!(outcomes[1].error.as_deref().unwrap().contains("syntax error"));

        assert_eq!(exec.current_version().await.unwrap(), 1);
        assert!(!table_exists(&exec, "ok2").await);
        assert!(!table_exists(&exec, "t3").await);
    }

    #[tokio::test]
    async fn test_unmet_dependencies_abort_before_sql() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(&dir, vec![migration(1), migration(3).depends_on(2)]).await;

        let result = exec.migrate().await;
        match result {
            Err(MigrationError::UnmetDependencies { messages }) => {
                assert_eq!(messages.len(), 1);
                assert!(messages[0].contains("v2"));
            }
            other => panic!("expected unmet dependencies, got {:?}", other),
        }
        assert_eq!(exec.current_version().await.unwrap(), 0);
        assert!(!table_exists(&exec, "t1").await);
    }

    #[tokio::test]
    async fn test_execute_migration_rechecks_dependencies() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(&dir, vec![migration(1), migration(2).depends_on(1)]).await;

        let result = exec.execute_migration(&migration(2).depends_on(1)).await;
        assert!(matches!(
            result,
            Err(MigrationError::DependencyNotApplied { dependency: 1, .. })
        ));
    }

    #[tokio::test]
    async fn test_apply_then_rollback_restores_schema() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(&dir, vec![migration(1), migration(2)]).await;
        exec.migrate().await.unwrap();

        let outcomes = exec.rollback(1, false).await.unwrap();
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].success);
        assert_eq!(exec.current_version().await.unwrap(), 1);
        assert!(!exec.applied_versions().await.unwrap().contains(&2));
        assert!(!table_exists(&exec, "t2").await);
        assert!(table_exists(&exec, "t1").await);
    }

    #[tokio::test]
    async fn test_risky_rollback_requires_force() {
        let dir = tempfile::tempdir().unwrap();
        let backfill = Migration::new("0002_backfill", 2, "backfill", "INSERT INTO t1 (id) VALUES (1);")
            .with_category(MigrationCategory::Data)
            .with_rollback("DELETE FROM t1 WHERE id = 1;");
        let exec = executor(&dir, vec![migration(1), backfill]).await;
        exec.migrate().await.unwrap();

        let blocked = exec.rollback(1, false).await;
        assert!(matches!(blocked, Err(MigrationError::RiskyRollback { .. })));
        assert_eq!(exec.current_version().await.unwrap(), 2);

        let outcomes = exec.rollback(1, true).await.unwrap();
        assert!(outcomes[0].success);
        assert_eq!(exec.current_version().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_rollback_without_sql_is_hard_error() {
        let dir = tempfile::tempdir().unwrap();
        let one_way = Migration::new("0002_one_way", 2, "one way", "CREATE TABLE one_way (id INTEGER);");
        let exec = executor(&dir, vec![migration(1), one_way.clone()]).await;
        exec.migrate().await.unwrap();

        let direct = exec.execute_rollback(&one_way).await;
        assert!(matches!(direct, Err(MigrationError::RollbackUnavailable { version: 2, .. })));

        let forced = exec.rollback(0, true).await;
        assert!(matches!(forced, Err(MigrationError::RollbackUnavailable { .. })));
        assert_eq!(exec.current_version().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_rollback_of_unapplied_migration() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(&dir, vec![migration(1)]).await;
        let result = exec.execute_rollback(&migration(1)).await;
        assert!(matches!(result, Err(MigrationError::MigrationNotFound { .. })));
    }

    #[tokio::test]
    async fn test_status_report() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(&dir, vec![migration(1), migration(2), migration(3)]).await;
        exec.execute_migration(&migration(1)).await.unwrap();

        let status = exec.get_status().await.unwrap();
        assert_eq!(status.current_version, 1);
        assert_eq!(status.applied_count, 1);
        assert_eq!(status.pending_count, 2);
        assert_eq!(status.last_applied.unwrap().migration_id, "0001_t1");
        assert_eq!(status.applied[0].applied_by, DEFAULT_APPLIED_BY);
    }

    #[tokio::test]
    async fn test_validate_integrity_detects_drift() {
        let dir = tempfile::tempdir().unwrap();
        {
            let exec = executor(&dir, vec![migration(1)]).await;
            exec.migrate().await.unwrap();
            assert!(exec.validate_integrity().await.unwrap().is_empty());
            exec.pool().close();
        }

        let edited = migration(1).with_description("edited after the fact");
        let exec = executor(&dir, vec![edited]).await;
        let issues = exec.validate_integrity().await.unwrap();
        assert_eq!(issues.len(), 1);
        assert!(matches!(&issues[0], IntegrityIssue::ChecksumMismatch { id, .. } if id == "0001_t1"));
    }

    #[tokio::test]
    async fn test_dry_run_touches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor_with(
            &dir,
            vec![migration(1), migration(2)],
            PoolConfig::default(),
            MigrationConfig::default().with_dry_run(true),
        )
        .await;

        let outcomes = exec.migrate().await.unwrap();
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|o| o.dry_run && o.success));
        assert_eq!(exec.current_version().await.unwrap(), 0);

        let plan = exec.dry_run_migrate().await.unwrap();
        assert_eq!(plan.total_count, 2);
    }

    #[tokio::test]
    async fn test_statement_timeout_is_a_failed_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let runaway = Migration::new(
            "0001_runaway",
            1,
            "runaway",
            "CREATE TABLE counted AS WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c) \
             SELECT count(*) AS n FROM c;",
        );
        let exec = executor_with(
            &dir,
            vec![runaway],
            PoolConfig::default().with_statement_timeout(Duration::from_millis(100)),
            MigrationConfig::default(),
        )
        .await;

        let outcomes = exec.migrate().await.unwrap();
        assert_eq!(outcomes.len(), 1);
        assert!(!outcomes[0].success);
        assert!(outcomes[0].error.as_deref().unwrap().contains("timed out"));
        assert_eq!(exec.current_version().await.unwrap(), 0);
    }
}
