//! Integration tests for blue-green deployments.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cutover_core::migration::IntegrityIssue;
use cutover_core::{
    BlueGreenOrchestrator, DeployConfig, DeployError, DeploymentPhase, EnvironmentName, Migration,
    MigrationCategory, MigrationStore,
};
use rusqlite::types::Value;

const SCHEMA: &str = "
CREATE TABLE venue (id INTEGER PRIMARY KEY, name TEXT NOT NULL);
CREATE TABLE event (
    id INTEGER PRIMARY KEY,
    venue_id INTEGER NOT NULL REFERENCES venue(id),
    title TEXT NOT NULL
);
";

struct TestContext {
    dir: tempfile::TempDir,
}

impl TestContext {
    fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
        }
    }

    fn config(&self) -> DeployConfig {
        DeployConfig::new(self.dir.path())
            .with_schema_sql(SCHEMA)
            .with_core_tables(["venue", "event"])
    }

    async fn open(&self, config: DeployConfig, migrations: Vec<Migration>) -> Arc<BlueGreenOrchestrator> {
        let store = Arc::new(MigrationStore::from_definitions(migrations));
        Arc::new(BlueGreenOrchestrator::open(config, store).await.unwrap())
    }

    fn exists(&self, name: EnvironmentName) -> bool {
        self.dir.path().join(name.file_name()).exists()
    }
}

fn add_capacity() -> Migration {
    Migration::new(
        "0001_add_event_capacity",
        1,
        "add event capacity",
        "ALTER TABLE event ADD COLUMN capacity INTEGER NOT NULL DEFAULT 0;",
    )
    .with_description("Track how many seats an event has")
    .with_rollback("ALTER TABLE event DROP COLUMN capacity;")
}

fn index_titles() -> Migration {
    Migration::new(
        "0002_index_event_titles",
        2,
        "index event titles",
        "CREATE INDEX event_title ON event (title);",
    )
    .with_category(MigrationCategory::Index)
    .with_rollback("DROP INDEX event_title;")
    .depends_on(1)
}

async fn seed(orch: &BlueGreenOrchestrator) {
    orch.active_pool()
        .unwrap()
        .execute_batch(
            "INSERT INTO venue VALUES (1, 'hall'), (2, 'park');
             INSERT INTO event VALUES (10, 1, 'gig'), (11, 2, 'fair');",
        )
        .await
        .unwrap();
}

async fn event_count(orch: &BlueGreenOrchestrator) -> i64 {
    orch.active_pool()
        .unwrap()
        .query("SELECT count(*) FROM event", vec![])
        .await
        .unwrap()
        .scalar_i64()
        .unwrap()
}

#[tokio::test]
async fn test_deploy_applies_plan_on_green() {
    let ctx = TestContext::new();
    let orch = ctx.open(ctx.config(), vec![add_capacity(), index_titles()]).await;
    seed(&orch).await;

    let result = orch.deploy_pending().await.unwrap();
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.active_environment, EnvironmentName::Green);
    assert_eq!(result.schema_version, 2);
    assert_eq!(result.migrations.len(), 2);
    assert_eq!(result.copy.as_ref().unwrap().total_rows(), 4);

    assert_eq!(event_count(&orch).await, 2);
    let rows = orch
        .active_pool()
        .unwrap()
        .query("SELECT capacity FROM event WHERE id = 10", vec![])
        .await
        .unwrap();
    assert_eq!(rows.scalar_i64(), Some(0));

    let status = orch.active_executor().unwrap().get_status().await.unwrap();
    assert_eq!(status.current_version, 2);
    assert_eq!(status.pending_count, 0);

    orch.shutdown().await;
}

#[tokio::test]
async fn test_invalid_sql_leaves_active_untouched() {
    let ctx = TestContext::new();
    let broken = Migration::new(
        "0001_broken",
        1,
        "broken",
        "ALTER TABLE event ADD COLUMN capacity INTEGER; ALTER TABEL event DROP COLUMN title;",
    )
    .with_rollback("ALTER TABLE event DROP COLUMN capacity;");
    let orch = ctx.open(ctx.config(), vec![broken]).await;
    seed(&orch).await;

    let result = orch.deploy_pending().await.unwrap();
    assert!(!result.success);
    assert_eq!(result.failed_phase, Some(DeploymentPhase::ApplyingMigrations));
    assert!(result.error.as_deref().unwrap().contains("0001_broken"));
    assert_eq!(result.active_environment, EnvironmentName::Blue);
    assert!(!result.rollback_available);

    assert_eq!(orch.phase(), DeploymentPhase::Failed);
    assert!(!ctx.exists(EnvironmentName::Green));
    assert!(orch.registry().get(EnvironmentName::Green).is_none());
    assert_eq!(orch.registry().active_name(), Some(EnvironmentName::Blue));
    assert_eq!(event_count(&orch).await, 2);
    assert_eq!(orch.active_executor().unwrap().current_version().await.unwrap(), 0);
}

#[tokio::test]
async fn test_deploy_after_failure_succeeds() {
    let ctx = TestContext::new();
    let failing = Migration::new("0001_failing", 1, "failing", "INSERT INTO missing_table VALUES (1);");
    {
        let orch = ctx.open(ctx.config(), vec![failing]).await;
        assert!(!orch.deploy_pending().await.unwrap().success);
        orch.shutdown().await;
    }

    let orch = ctx.open(ctx.config(), vec![add_capacity()]).await;
    let result = orch.deploy_pending().await.unwrap();
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.active_environment, EnvironmentName::Green);
    orch.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_deploy_is_rejected() {
    let ctx = TestContext::new();
    let orch = ctx.open(ctx.config(), vec![add_capacity()]).await;
    let plan = orch
        .active_executor()
        .unwrap()
        .create_migration_plan()
        .await
        .unwrap();

    let (first, second) = tokio::join!(orch.deploy_schema(&plan), orch.deploy_schema(&plan));
    assert!(first.unwrap().success);
    let err = second.unwrap_err();
    assert!(matches!(err, DeployError::DeploymentInProgress));
    assert_eq!(err.to_string(), "deployment already in progress");

    orch.shutdown().await;
}

#[tokio::test]
async fn test_unmet_dependencies_reject_deploy() {
    let ctx = TestContext::new();
    let orch = ctx.open(ctx.config(), vec![index_titles()]).await;

    let err = orch.deploy_pending().await.unwrap_err();
    assert!(matches!(err, DeployError::UnmetDependencies { .. }));
    assert_eq!(orch.phase(), DeploymentPhase::Idle);
    assert!(!ctx.exists(EnvironmentName::Green));
    assert!(!orch.registry().is_deployment_in_progress());
}

#[tokio::test]
async fn test_duplicate_versions_reject_deploy_and_migrate() {
    let ctx = TestContext::new();
    let twin = Migration::new(
        "0001_add_event_notes",
        1,
        "add event notes",
        "ALTER TABLE event ADD COLUMN notes TEXT;",
    );
    let orch = ctx.open(ctx.config(), vec![add_capacity(), twin]).await;

    match orch.deploy_pending().await.unwrap_err() {
        DeployError::UnmetDependencies { messages } => {
            assert!(messages[0].contains("duplicate migration version v1"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(!ctx.exists(EnvironmentName::Green));
    assert!(orch.active_executor().unwrap().migrate().await.is_err());
    assert_eq!(orch.active_executor().unwrap().current_version().await.unwrap(), 0);
}

#[tokio::test]
async fn test_rollback_within_window() {
    let ctx = TestContext::new();
    let orch = ctx.open(ctx.config(), vec![add_capacity()]).await;
    seed(&orch).await;
    orch.deploy_pending().await.unwrap();
    assert!(orch.rollback_available());
    assert!(orch.rollback_remaining().is_some());

    let result = orch.rollback().await.unwrap();
    assert!(result.success);
    assert_eq!(result.active_environment, EnvironmentName::Blue);
    assert_eq!(result.schema_version, 0);
    assert_eq!(event_count(&orch).await, 2);
    assert!(!ctx.exists(EnvironmentName::Green));

    let health = orch.system_health().await;
    assert_eq!(health.active, Some(EnvironmentName::Blue));
    assert!(!health.rollback_available);
    assert_eq!(health.phase, DeploymentPhase::RolledBack);
}

#[tokio::test]
async fn test_rollback_after_window_expired() {
    let ctx = TestContext::new();
    let config = ctx.config().with_rollback_window(Duration::from_millis(100));
    let orch = ctx.open(config, vec![add_capacity()]).await;
    orch.deploy_pending().await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), orch.wait_for_rollback_window())
        .await
        .unwrap();
    assert!(!ctx.exists(EnvironmentName::Blue));
    assert_eq!(orch.phase(), DeploymentPhase::Idle);

    let err = orch.rollback().await.unwrap_err();
    assert!(matches!(err, DeployError::RollbackUnavailable));
    assert_eq!(err.to_string(), "rollback not available");
    assert_eq!(orch.registry().active_name(), Some(EnvironmentName::Green));
}

#[tokio::test]
async fn test_second_deploy_replaces_previous_side() {
    let ctx = TestContext::new();
    let orch = ctx.open(ctx.config(), vec![add_capacity(), index_titles()]).await;

    let first = orch.active_executor().unwrap().create_migration_plan().await.unwrap();
    let mut only_first = first.clone();
    only_first.migrations.truncate(1);
    only_first.total_count = 1;
    assert!(orch.deploy_schema(&only_first).await.unwrap().success);
    assert_eq!(orch.registry().active_name(), Some(EnvironmentName::Green));

    let result = orch.deploy_pending().await.unwrap();
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.active_environment, EnvironmentName::Blue);
    assert_eq!(result.previous_environment, Some(EnvironmentName::Green));
    assert_eq!(result.schema_version, 2);
    assert_eq!(result.migrations.len(), 1);

    orch.shutdown().await;
}

#[tokio::test]
async fn test_never_two_active_environments() {
    let ctx = TestContext::new();
    let orch = ctx.open(ctx.config(), vec![add_capacity()]).await;
    seed(&orch).await;

    let done = Arc::new(AtomicBool::new(false));
    let watcher = {
        let registry = orch.registry().clone();
        let done = done.clone();
        tokio::spawn(async move {
            let mut observed = 0usize;
            while !done.load(Ordering::SeqCst) {
                let active = registry.snapshot().iter().filter(|s| s.active).count();
                assert_eq!(active, 1, "snapshot showed {} active environments", active);
                observed += 1;
                tokio::task::yield_now().await;
            }
            observed
        })
    };

    assert!(orch.deploy_pending().await.unwrap().success);
    orch.rollback().await.unwrap();
    done.store(true, Ordering::SeqCst);
    assert!(watcher.await.unwrap() > 0);
}

#[tokio::test]
async fn test_migrate_twice_on_active() {
    let ctx = TestContext::new();
    let orch = ctx.open(ctx.config(), vec![add_capacity(), index_titles()]).await;
    let executor = orch.active_executor().unwrap();

    let first = executor.migrate().await.unwrap();
    assert_eq!(first.len(), 2);
    let ledger = executor.ledger().await.unwrap();

    assert!(executor.migrate().await.unwrap().is_empty());
    assert!(executor.migrate().await.unwrap().is_empty());
    assert_eq!(executor.ledger().await.unwrap(), ledger);
}

#[tokio::test]
async fn test_plan_with_applied_dependency() {
    let ctx = TestContext::new();
    let orch = ctx.open(ctx.config(), vec![index_titles(), add_capacity()]).await;
    let executor = orch.active_executor().unwrap();
    assert!(executor.execute_migration(&add_capacity()).await.unwrap().success);

    let plan = executor.create_migration_plan().await.unwrap();
    assert_eq!(plan.total_count, 1);
    assert_eq!(plan.migrations[0].version, 2);
    assert!(plan.dependencies.is_empty());
    assert!(plan.can_rollback);
}

#[tokio::test]
async fn test_checksum_drift_after_redeploy() {
    let ctx = TestContext::new();
    {
        let config = ctx.config().with_rollback_window(Duration::ZERO);
        let orch = ctx.open(config, vec![add_capacity()]).await;
        assert!(orch.deploy_pending().await.unwrap().success);
        orch.shutdown().await;
    }

    let edited = add_capacity().with_description("Seats per event");
    let orch = ctx.open(ctx.config(), vec![edited]).await;
    let issues = orch.active_executor().unwrap().validate_integrity().await.unwrap();
    assert_eq!(issues.len(), 1);
    assert!(matches!(
        &issues[0],
        IntegrityIssue::ChecksumMismatch { id, .. } if id == "0001_add_event_capacity"
    ));
}

#[tokio::test]
async fn test_apply_then_roll_back_on_active() {
    let ctx = TestContext::new();
    let orch = ctx.open(ctx.config(), vec![add_capacity()]).await;
    let executor = orch.active_executor().unwrap();
    executor.migrate().await.unwrap();

    let outcomes = executor.rollback(0, false).await.unwrap();
    assert_eq!(outcomes.len(), 1);
    assert!(outcomes[0].success);
    assert!(executor.ledger().await.unwrap().is_empty());

    let columns = orch
        .active_pool()
        .unwrap()
        .query("SELECT name FROM pragma_table_info('event')", vec![])
        .await
        .unwrap();
    assert!(!columns
        .rows
        .iter()
        .any(|row| row[0] == Value::Text("capacity".to_string())));
}

async fn column_names(orch: &BlueGreenOrchestrator, table: &str) -> Vec<Value> {
    orch.active_pool()
        .unwrap()
        .query(
            "SELECT name FROM pragma_table_info(?1)",
            vec![Value::Text(table.to_string())],
        )
        .await
        .unwrap()
        .rows
        .into_iter()
        .map(|mut row| row.remove(0))
        .collect()
}

async fn table_exists(orch: &BlueGreenOrchestrator, table: &str) -> bool {
    orch.active_pool()
        .unwrap()
        .query(
            "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            vec![Value::Text(table.to_string())],
        )
        .await
        .unwrap()
        .scalar_i64()
        == Some(1)
}

#[tokio::test]
async fn test_dropped_schema_stays_dropped_on_next_deploy() {
    let ctx = TestContext::new();
    let config = || {
        DeployConfig::new(ctx.dir.path())
            .with_schema_sql(
                "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT, legacy TEXT NOT NULL);
                 CREATE TABLE old_stuff (id INTEGER);",
            )
            .with_core_tables(["users"])
    };
    let drop_legacy = Migration::new(
        "0001_drop_legacy",
        1,
        "drop legacy",
        "ALTER TABLE users DROP COLUMN legacy; DROP TABLE old_stuff;",
    );
    let add_email = Migration::new(
        "0002_add_email",
        2,
        "add email",
        "ALTER TABLE users ADD COLUMN email TEXT;",
    );

    let orch = ctx.open(config(), vec![drop_legacy.clone()]).await;
    let first = orch.deploy_pending().await.unwrap();
    assert!(first.success, "{:?}", first.error);
    orch.active_pool()
        .unwrap()
        .execute("INSERT INTO users (id, name) VALUES (1, 'ada')", vec![])
        .await
        .unwrap();
    orch.shutdown().await;
    drop(orch);

    let orch = ctx.open(config(), vec![drop_legacy, add_email]).await;
    let second = orch.deploy_pending().await.unwrap();
    assert!(second.success, "{:?}", second.error);
    assert_eq!(second.schema_version, 2);

    let columns = column_names(&orch, "users").await;
    assert!(!columns.contains(&Value::Text("legacy".to_string())));
    assert!(columns.contains(&Value::Text("email".to_string())));
    assert!(!table_exists(&orch, "old_stuff").await);

    let rows = orch
        .active_pool()
        .unwrap()
        .query("SELECT name FROM users WHERE id = 1", vec![])
        .await
        .unwrap();
    assert_eq!(rows.rows, vec![vec![Value::Text("ada".to_string())]]);

    orch.shutdown().await;
}

#[tokio::test]
async fn test_missing_core_table_fails_validation() {
    let ctx = TestContext::new();
    let drop_event = Migration::new("0001_drop_event", 1, "drop event", "DROP TABLE event;");
    let orch = ctx.open(ctx.config(), vec![drop_event]).await;
    seed(&orch).await;

    let result = orch.deploy_pending().await.unwrap();
    assert!(!result.success);
    assert_eq!(result.failed_phase, Some(DeploymentPhase::Validating));
    assert_eq!(result.active_environment, EnvironmentName::Blue);
    assert_eq!(orch.registry().active_name(), Some(EnvironmentName::Blue));
    assert_eq!(event_count(&orch).await, 2);

    orch.shutdown().await;
}
