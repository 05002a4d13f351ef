//! Blue-green orchestrator.
//!
//! A deployment builds the inactive environment from scratch, copies the
//! live data into it, applies the planned migrations, validates the result
//! and then moves the active pointer in one step. The previous environment
//! stays available for an instant rollback until the rollback window closes.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::config::DeployConfig;
use super::error::DeployError;
use super::state::{DeploymentPhase, DeploymentResult, SystemHealth};
use super::window::{close_window, retire_environment, RollbackWindow};
use crate::environment::handle::remove_database_files;
use crate::environment::{
    copy_all_tables, CopyReport, Environment, EnvironmentName, EnvironmentRegistry, HealthStatus,
    RegistryState,
};
use crate::migration::{MigrationExecutor, MigrationOutcome, MigrationPlan, MigrationStore, LEDGER_TABLE};
use crate::pool::ConnectionPool;
use crate::sql::quote_ident;

/// A deployment step that failed.
struct StepFailure {
    phase: DeploymentPhase,
    message: String,
}

impl StepFailure {
    fn new(phase: DeploymentPhase, error: impl std::fmt::Display) -> Self {
        Self {
            phase,
            message: error.to_string(),
        }
    }
}

/// What the validation battery read from the target.
#[derive(Debug)]
struct ValidationReadings {
    quick_check: String,
    ledger_rows: i64,
    table_rows: Vec<(String, i64)>,
    missing_tables: Vec<String>,
    schema_version: i64,
}

/// Coordinates deployments across the blue and green environments.
///
/// Construct once and share by `Arc`.
pub struct BlueGreenOrchestrator {
    config: DeployConfig,
    registry: Arc<EnvironmentRegistry>,
    store: Arc<MigrationStore>,
    phase: Arc<Mutex<DeploymentPhase>>,
    window: Mutex<Option<RollbackWindow>>,
    rollback_available: Arc<watch::Sender<bool>>,
}

impl BlueGreenOrchestrator {
    /// Open the data directory, bootstrapping `blue` when it holds no state.
    pub async fn open(config: DeployConfig, store: Arc<MigrationStore>) -> Result<Self, DeployError> {
        std::fs::create_dir_all(&config.data_dir).map_err(crate::error::Error::from)?;
        let registry = Arc::new(EnvironmentRegistry::new(config.data_dir.clone()));

        let orchestrator = Self {
            registry,
            store,
            phase: Arc::new(Mutex::new(DeploymentPhase::Idle)),
            window: Mutex::new(None),
            rollback_available: Arc::new(watch::channel(false).0),
            config,
        };

        match RegistryState::load(&orchestrator.config.data_dir)? {
            Some(state) => orchestrator.restore(state.active).await?,
            None => orchestrator.bootstrap().await?,
        }
        Ok(orchestrator)
    }

    async fn restore(&self, active: EnvironmentName) -> Result<(), DeployError> {
        let data_dir = &self.config.data_dir;
        let env = Arc::new(Environment::open_existing(data_dir, active, self.config.pool.clone())?);
        self.executor_for(env.pool()).initialize().await?;
        self.registry.install(env.clone())?;
        self.registry.activate(active)?;

        // A side left behind by an earlier process is registered so it shows
        // up in health reports; the next deployment replaces it.
        let leftover = Environment::file_path(data_dir, active.other());
        if leftover.exists() {
            let env = Environment::open_existing(data_dir, active.other(), self.config.pool.clone())?;
            self.registry.install(Arc::new(env))?;
            debug!(environment = %active.other(), "registered leftover inactive environment");
        }

        let version = env.refresh_schema_version().await?;
        info!(active = %active, version, data_dir = %data_dir.display(), "opened environments");
        Ok(())
    }

    async fn bootstrap(&self) -> Result<(), DeployError> {
        let data_dir = &self.config.data_dir;
        let name = EnvironmentName::Blue;

        let env = if Environment::file_path(data_dir, name).exists() {
            Environment::open_existing(data_dir, name, self.config.pool.clone())?
        } else {
            let env = Environment::create(data_dir, name, self.config.pool.clone())?;
            env.materialize_schema(self.config.schema.load()?).await?;
            env
        };
        let env = Arc::new(env);

        self.executor_for(env.pool()).initialize().await?;
        self.registry.install(env.clone())?;
        self.registry.activate(name)?;
        self.registry.persist()?;

        let version = env.refresh_schema_version().await?;
        env.probe().await;
        info!(active = %name, version, data_dir = %data_dir.display(), "bootstrapped environment");
        Ok(())
    }

    /// Orchestrator configuration.
    pub fn config(&self) -> &DeployConfig {
        &self.config
    }

    /// The environment registry.
    pub fn registry(&self) -> &Arc<EnvironmentRegistry> {
        &self.registry
    }

    /// The migration definition store.
    pub fn store(&self) -> &Arc<MigrationStore> {
        &self.store
    }

    /// Current phase.
    pub fn phase(&self) -> DeploymentPhase {
        *self.phase.lock()
    }

    /// Whether an instant rollback is possible right now.
    pub fn rollback_available(&self) -> bool {
        *self.rollback_available.borrow()
    }

    /// Time left in the rollback window.
    pub fn rollback_remaining(&self) -> Option<Duration> {
        if !self.rollback_available() {
            return None;
        }
        self.window.lock().as_ref().map(RollbackWindow::remaining)
    }

    /// Pool of the active environment.
    ///
    /// Re-fetch for every unit of work; the pool changes after a switch.
    pub fn active_pool(&self) -> Result<ConnectionPool, DeployError> {
        self.registry
            .active()
            .map(|env| env.pool().clone())
            .ok_or(DeployError::NoActiveEnvironment)
    }

    /// Migration executor bound to the active environment.
    pub fn active_executor(&self) -> Result<MigrationExecutor, DeployError> {
        Ok(self.executor_for(&self.active_pool()?))
    }

    fn executor_for(&self, pool: &ConnectionPool) -> MigrationExecutor {
        MigrationExecutor::new(pool.clone(), self.store.clone(), self.config.migration.clone())
    }

    /// Plan against the active ledger and deploy the pending migrations.
    pub async fn deploy_pending(&self) -> Result<DeploymentResult, DeployError> {
        let plan = self.active_executor()?.create_migration_plan().await?;
        self.deploy_schema(&plan).await
    }

    /// Deploy `plan` to the inactive environment and switch to it.
    ///
    /// Rejections (another deployment running, unmet dependencies) are
    /// errors. Once the deployment has started, a failing step is reported
    /// as an unsuccessful result and the active environment is untouched.
    pub async fn deploy_schema(&self, plan: &MigrationPlan) -> Result<DeploymentResult, DeployError> {
        let _guard = self
            .registry
            .try_begin_deployment()
            .ok_or(DeployError::DeploymentInProgress)?;
        if plan.has_unmet_dependencies() {
            return Err(DeployError::UnmetDependencies {
                messages: plan.dependencies.clone(),
            });
        }
        let active = self.registry.active().ok_or(DeployError::NoActiveEnvironment)?;
        let target_name = active.name().other();
        let started = Instant::now();

        info!(
            active = %active.name(),
            target = %target_name,
            migrations = plan.total_count,
            "starting deployment"
        );

        // The previous side of an earlier deployment lives at the target
        // name; it goes away now.
        if let Some(window) = self.window.lock().take() {
            window.cancel();
        }
        self.rollback_available.send_replace(false);
        self.set_phase(DeploymentPhase::PreparingTarget);

        let mut outcomes = Vec::new();
        let mut copy = None;
        let step = self
            .run_steps(&active, target_name, plan, &mut outcomes, &mut copy)
            .await;

        let target = match step {
            Ok(target) => target,
            Err(failure) => {
                error!(
                    phase = %failure.phase,
                    target = %target_name,
                    error = %failure.message,
                    "deployment failed, {} remains active",
                    active.name()
                );
                self.discard_target(target_name);
                self.set_phase(DeploymentPhase::Failed);
                return Ok(DeploymentResult {
                    success: false,
                    active_environment: active.name(),
                    previous_environment: None,
                    schema_version: active.schema_version(),
                    duration_ms: started.elapsed().as_millis() as u64,
                    rollback_available: false,
                    error: Some(failure.message),
                    failed_phase: Some(failure.phase),
                    migrations: outcomes,
                    copy,
                });
            }
        };

        self.registry.activate(target_name)?;
        self.set_phase(DeploymentPhase::Switched);
        if let Err(e) = self.registry.persist() {
            warn!(error = %e, "failed to persist registry state");
        }

        let previous = active.name();
        let rollback_available = self.arm_window(previous);

        info!(
            active = %target_name,
            previous = %previous,
            version = target.schema_version(),
            duration_ms = started.elapsed().as_millis() as u64,
            rollback_available,
            "deployment complete"
        );

        Ok(DeploymentResult {
            success: true,
            active_environment: target_name,
            previous_environment: rollback_available.then_some(previous),
            schema_version: target.schema_version(),
            duration_ms: started.elapsed().as_millis() as u64,
            rollback_available,
            error: None,
            failed_phase: None,
            migrations: outcomes,
            copy,
        })
    }

    async fn run_steps(
        &self,
        active: &Arc<Environment>,
        target_name: EnvironmentName,
        plan: &MigrationPlan,
        outcomes: &mut Vec<MigrationOutcome>,
        copy: &mut Option<CopyReport>,
    ) -> Result<Arc<Environment>, StepFailure> {
        let phase = DeploymentPhase::PreparingTarget;
        let target = self
            .prepare_target(target_name)
            .await
            .map_err(|e| StepFailure::new(phase, e))?;

        let phase = DeploymentPhase::CopyingData;
        self.set_phase(phase);
        let source = active.path().to_path_buf();
        let report = target
            .pool()
            .with_connection(move |conn| copy_all_tables(conn, &source))
            .await
            .map_err(|e| StepFailure::new(phase, e))?;
        *copy = Some(report);
        let copied_version = target
            .refresh_schema_version()
            .await
            .map_err(|e| StepFailure::new(phase, e))?;

        let phase = DeploymentPhase::ApplyingMigrations;
        self.set_phase(phase);
        let executor = self.executor_for(target.pool());
        *outcomes = executor
            .apply_plan(plan)
            .await
            .map_err(|e| StepFailure::new(phase, e))?;
        if let Some(failed) = outcomes.iter().find(|o| !o.success) {
            return Err(StepFailure::new(
                phase,
                format!(
                    "migration {} (v{}) failed: {}",
                    failed.migration_id,
                    failed.version,
                    failed.error.as_deref().unwrap_or("unknown error")
                ),
            ));
        }

        let phase = DeploymentPhase::Validating;
        self.set_phase(phase);
        let expected = plan
            .target_version()
            .map_or(copied_version, |v| v.max(copied_version));
        self.validate(&target, expected)
            .await
            .map_err(|message| StepFailure { phase, message })?;

        Ok(target)
    }

    async fn prepare_target(&self, name: EnvironmentName) -> Result<Arc<Environment>, DeployError> {
        retire_environment(&self.registry, name);

        let schema = self.config.schema.load()?;
        let target = Arc::new(Environment::create(&self.config.data_dir, name, self.config.pool.clone())?);
        self.registry.install(target.clone())?;

        target.materialize_schema(schema).await?;
        self.executor_for(target.pool()).initialize().await?;
        debug!(target = %name, "target environment prepared");
        Ok(target)
    }

    async fn validate(&self, target: &Environment, expected_version: i64) -> Result<(), String> {
        let core_tables = self.config.core_tables.clone();
        let readings = target
            .pool()
            .with_connection(move |conn| {
                let quick_check: String = conn.query_row("PRAGMA quick_check", [], |row| row.get(0))?;
                let ledger_rows: i64 = conn.query_row(
                    &format!("SELECT count(*) FROM {}", quote_ident(LEDGER_TABLE)),
                    [],
                    |row| row.get(0),
                )?;

                let mut table_rows = Vec::new();
                let mut missing_tables = Vec::new();
                for table in core_tables {
                    let exists: bool = conn.query_row(
                        "SELECT EXISTS (SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
                        [&table],
                        |row| row.get(0),
                    )?;
                    if !exists {
                        missing_tables.push(table);
                        continue;
                    }
                    let rows: i64 = conn.query_row(
                        &format!("SELECT count(*) FROM {}", quote_ident(&table)),
                        [],
                        |row| row.get(0),
                    )?;
                    table_rows.push((table, rows));
                }

                let schema_version = crate::migration::ledger::current_version(conn)?;
                Ok(ValidationReadings {
                    quick_check,
                    ledger_rows,
                    table_rows,
                    missing_tables,
                    schema_version,
                })
            })
            .await
            .map_err(|e| e.to_string())?;

        debug!(
            target = %target.name(),
            ledger_rows = readings.ledger_rows,
            tables = ?readings.table_rows,
            "validation readings"
        );

        if readings.quick_check != "ok" {
            return Err(format!("integrity check failed: {}", readings.quick_check));
        }
        if !readings.missing_tables.is_empty() {
            return Err(format!(
                "core tables missing: {}",
                readings.missing_tables.join(", ")
            ));
        }
        if readings.schema_version != expected_version {
            return Err(format!(
                "schema version is v{}, expected v{}",
                readings.schema_version, expected_version
            ));
        }
        if target.probe().await != HealthStatus::Healthy {
            return Err(format!("environment {} is unhealthy", target.name()));
        }
        target.refresh_schema_version().await.map_err(|e| e.to_string())?;
        Ok(())
    }

    fn discard_target(&self, name: EnvironmentName) {
        retire_environment(&self.registry, name);
        // Covers a target that failed before it was registered.
        let path: PathBuf = Environment::file_path(&self.config.data_dir, name);
        if let Err(e) = remove_database_files(&path) {
            warn!(environment = %name, error = %e, "failed to remove target files");
        }
    }

    /// Keep `previous` for the rollback window. Returns whether rollback is
    /// available.
    fn arm_window(&self, previous: EnvironmentName) -> bool {
        if self.config.rollback_window.is_zero() {
            close_window(&self.registry, previous, &self.rollback_available, &self.phase);
            self.set_phase(DeploymentPhase::Idle);
            return false;
        }

        self.set_phase(DeploymentPhase::RollbackArmed);
        let window = RollbackWindow::arm(
            self.registry.clone(),
            previous,
            self.config.rollback_window,
            self.rollback_available.clone(),
            self.phase.clone(),
        );
        *self.window.lock() = Some(window);
        true
    }

    /// Switch back to the environment kept by the last deployment.
    ///
    /// The environment that was active is torn down right away; no further
    /// rollback is offered.
    pub async fn rollback(&self) -> Result<DeploymentResult, DeployError> {
        let Some(_guard) = self.registry.try_begin_deployment() else {
            let window_open = self.window.lock().as_ref().is_some_and(|w| !w.is_expired());
            return Err(if window_open && self.rollback_available() {
                DeployError::DeploymentInProgress
            } else {
                DeployError::RollbackUnavailable
            });
        };
        let started = Instant::now();

        let (previous_name, expired) = match self.window.lock().as_ref() {
            Some(window) if self.rollback_available() => (window.previous(), window.is_expired()),
            _ => return Err(DeployError::RollbackUnavailable),
        };
        if expired {
            // The timer gives way to the slot we hold, so close the window here.
            if let Some(window) = self.window.lock().take() {
                window.cancel();
            }
            close_window(&self.registry, previous_name, &self.rollback_available, &self.phase);
            return Err(DeployError::RollbackUnavailable);
        }

        let previous = self
            .registry
            .get(previous_name)
            .ok_or(DeployError::RollbackUnavailable)?;
        if previous.probe().await != HealthStatus::Healthy {
            return Err(DeployError::EnvironmentUnhealthy {
                name: previous_name,
            });
        }

        if let Some(window) = self.window.lock().take() {
            window.cancel();
        }
        let abandoned = self.registry.activate(previous_name)?;
        self.rollback_available.send_replace(false);
        self.set_phase(DeploymentPhase::RolledBack);
        if let Err(e) = self.registry.persist() {
            warn!(error = %e, "failed to persist registry state");
        }
        if let Some(abandoned) = abandoned {
            retire_environment(&self.registry, abandoned);
        }

        let version = previous.refresh_schema_version().await?;
        info!(active = %previous_name, version, "rolled back");

        Ok(DeploymentResult {
            success: true,
            active_environment: previous_name,
            previous_environment: None,
            schema_version: version,
            duration_ms: started.elapsed().as_millis() as u64,
            rollback_available: false,
            error: None,
            failed_phase: None,
            migrations: Vec::new(),
            copy: None,
        })
    }

    /// Probe every environment and report both.
    pub async fn system_health(&self) -> SystemHealth {
        for env in self.registry.environments() {
            env.probe().await;
            if let Err(e) = env.refresh_schema_version().await {
                debug!(environment = %env.name(), error = %e, "could not read schema version");
            }
        }

        let phase = self.phase();
        SystemHealth {
            environments: self.registry.snapshot(),
            active: self.registry.active_name(),
            rollback_available: self.rollback_available(),
            rollback_remaining_ms: self.rollback_remaining().map(|d| d.as_millis() as u64),
            deployment_in_progress: self.registry.is_deployment_in_progress() || phase.is_running(),
            phase,
        }
    }

    /// Resolve once no rollback is available.
    pub async fn wait_for_rollback_window(&self) {
        let mut rx = self.rollback_available.subscribe();
        while *rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    /// Close the rollback window now and release every pool.
    pub async fn shutdown(&self) {
        let window = self.window.lock().take();
        if let Some(window) = window {
            let previous = window.previous();
            window.cancel();
            // A deployment still holding the slot cleans up after itself.
            if let Some(_guard) = self.registry.try_begin_deployment() {
                close_window(&self.registry, previous, &self.rollback_available, &self.phase);
            }
        }
        for env in self.registry.environments() {
            env.pool().close();
        }
        info!("orchestrator shut down");
    }

    fn set_phase(&self, next: DeploymentPhase) {
        let mut phase = self.phase.lock();
        if !phase.can_transition_to(next) {
            warn!(from = %*phase, to = %next, "unexpected phase transition");
        }
        debug!(from = %*phase, to = %next, "phase");
        *phase = next;
    }
}

impl std::fmt::Debug for BlueGreenOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlueGreenOrchestrator")
            .field("data_dir", &self.config.data_dir)
            .field("active", &self.registry.active_name())
            .field("phase", &self.phase())
            .finish()
    }
}
