//! Subcommand handling.

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Subcommand;
use tracing::{info, warn};

use cutover_core::migration::{scaffold, MigrationError};
use cutover_core::{BlueGreenOrchestrator, DeployConfig, DeployError, MigrationStore};

use crate::formatter::Formatter;

/// Subcommands.
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Show the migration status of the active environment
    Status,

    /// Apply pending migrations to the active environment in place
    Migrate {
        /// Print the plan without running it
        #[arg(long)]
        dry_run: bool,
    },

    /// Roll the active environment back to a schema version
    Rollback {
        /// Version to roll back to
        version: i64,

        /// Roll back even when the plan is flagged as risky
        #[arg(long)]
        force: bool,

        /// Print the rollback plan without running it
        #[arg(long)]
        dry_run: bool,
    },

    /// Check definitions and the ledger for integrity issues
    Validate,

    /// Create a new migration template in the migrations directory
    Create {
        /// Human-readable migration name
        name: String,
    },

    /// Deploy pending migrations to the inactive environment and switch to it
    Deploy {
        /// Print the plan without preparing an environment
        #[arg(long)]
        dry_run: bool,

        /// Keep running until the rollback window closes; Ctrl+C rolls back
        #[arg(long)]
        hold: bool,
    },

    /// Show the applied migration ledger of the active environment
    History,

    /// Probe both environments
    Health,
}

/// Whether a command did what it was asked to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    /// Completed.
    Success,
    /// Ran, but a step failed or a check reported problems.
    Failed,
}

impl From<CommandStatus> for ExitCode {
    fn from(status: CommandStatus) -> Self {
        match status {
            CommandStatus::Success => ExitCode::SUCCESS,
            CommandStatus::Failed => ExitCode::FAILURE,
        }
    }
}

/// Invalid command-line input.
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    /// An argument value that cannot be used.
    #[error("invalid value for --{flag}: {reason}")]
    InvalidArgument {
        /// Flag name.
        flag: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

/// Run a subcommand against the environments in `config.data_dir`.
pub async fn execute(
    command: &Command,
    config: DeployConfig,
    migrations_dir: &Path,
    formatter: &dyn Formatter,
) -> Result<CommandStatus, Box<dyn std::error::Error>> {
    // Templates need no environment.
    if let Command::Create { name } = command {
        return create(migrations_dir, name, formatter);
    }

    let store = Arc::new(load_store(migrations_dir)?);
    let orchestrator = BlueGreenOrchestrator::open(config, store).await?;
    let result = dispatch(command, &orchestrator, migrations_dir, formatter).await;
    orchestrator.shutdown().await;
    result
}

fn create(
    migrations_dir: &Path,
    name: &str,
    formatter: &dyn Formatter,
) -> Result<CommandStatus, Box<dyn std::error::Error>> {
    let path = scaffold(migrations_dir, name)?;
    println!("{}", formatter.format_message(&format!("Created {}", path.display())));
    Ok(CommandStatus::Success)
}

fn load_store(dir: &Path) -> Result<MigrationStore, MigrationError> {
    if !dir.exists() {
        warn!(dir = %dir.display(), "migrations directory does not exist; no migrations loaded");
        return Ok(MigrationStore::default());
    }
    let store = MigrationStore::load_dir(dir)?;
    for failure in store.load_failures() {
        warn!(source = %failure.source, reason = %failure.reason, "skipped migration file");
    }
    Ok(store)
}

async fn dispatch(
    command: &Command,
    orchestrator: &BlueGreenOrchestrator,
    migrations_dir: &Path,
    formatter: &dyn Formatter,
) -> Result<CommandStatus, Box<dyn std::error::Error>> {
    match command {
        Command::Status => {
            let active = orchestrator
                .registry()
                .active_name()
                .ok_or(DeployError::NoActiveEnvironment)?;
            let status = orchestrator.active_executor()?.get_status().await?;
            println!("{}", formatter.format_status(active, &status));
            Ok(CommandStatus::Success)
        }

        Command::Migrate { dry_run } => migrate(orchestrator, *dry_run, formatter).await,

        Command::Rollback {
            version,
            force,
            dry_run,
        } => rollback_to(orchestrator, *version, *force, *dry_run, formatter).await,

        Command::Validate => {
            let issues = orchestrator.active_executor()?.validate_integrity().await?;
            println!("{}", formatter.format_issues(&issues));
            Ok(if issues.is_empty() {
                CommandStatus::Success
            } else {
                CommandStatus::Failed
            })
        }

        Command::Create { name } => create(migrations_dir, name, formatter),

        Command::Deploy { dry_run, hold } => deploy(orchestrator, *dry_run, *hold, formatter).await,

        Command::History => {
            let entries = orchestrator.active_executor()?.ledger().await?;
            println!("{}", formatter.format_history(&entries));
            Ok(CommandStatus::Success)
        }

        Command::Health => {
            let health = orchestrator.system_health().await;
            println!("{}", formatter.format_health(&health));
            Ok(if health.is_healthy() {
                CommandStatus::Success
            } else {
                CommandStatus::Failed
            })
        }
    }
}

async fn migrate(
    orchestrator: &BlueGreenOrchestrator,
    dry_run: bool,
    formatter: &dyn Formatter,
) -> Result<CommandStatus, Box<dyn std::error::Error>> {
    let executor = orchestrator.active_executor()?;

    if dry_run {
        let plan = executor.dry_run_migrate().await?;
        println!("{}", formatter.format_plan(&plan));
        return Ok(if plan.has_unmet_dependencies() {
            CommandStatus::Failed
        } else {
            CommandStatus::Success
        });
    }

    let outcomes = executor.migrate().await?;
    println!("{}", formatter.format_outcomes(&outcomes));
    if let Some(failed) = outcomes.iter().find(|o| !o.success) {
        let version = executor.current_version().await?;
        eprintln!(
            "{}",
            formatter.format_error(&format!(
                "migration {} failed; schema remains at v{}",
                failed.migration_id, version
            ))
        );
        return Ok(CommandStatus::Failed);
    }
    Ok(CommandStatus::Success)
}

async fn rollback_to(
    orchestrator: &BlueGreenOrchestrator,
    version: i64,
    force: bool,
    dry_run: bool,
    formatter: &dyn Formatter,
) -> Result<CommandStatus, Box<dyn std::error::Error>> {
    if version < 0 {
        return Err(CliError::InvalidArgument {
            flag: "version",
            reason: format!("{} is negative", version),
        }
        .into());
    }
    let executor = orchestrator.active_executor()?;

    if dry_run {
        let plan = executor.dry_run_rollback(version).await?;
        println!("{}", formatter.format_rollback_plan(&plan));
        return Ok(CommandStatus::Success);
    }

    match executor.rollback(version, force).await {
        Ok(outcomes) => {
            println!("{}", formatter.format_outcomes(&outcomes));
            Ok(if outcomes.iter().all(|o| o.success) {
                CommandStatus::Success
            } else {
                CommandStatus::Failed
            })
        }
        Err(e @ MigrationError::RiskyRollback { .. }) => {
            eprintln!("{}", formatter.format_error(&format!("{}; pass --force to proceed", e)));
            Ok(CommandStatus::Failed)
        }
        Err(e) => Err(e.into()),
    }
}

async fn deploy(
    orchestrator: &BlueGreenOrchestrator,
    dry_run: bool,
    hold: bool,
    formatter: &dyn Formatter,
) -> Result<CommandStatus, Box<dyn std::error::Error>> {
    if dry_run {
        let plan = orchestrator.active_executor()?.create_migration_plan().await?;
        println!("{}", formatter.format_plan(&plan));
        return Ok(if plan.has_unmet_dependencies() {
            CommandStatus::Failed
        } else {
            CommandStatus::Success
        });
    }

    let mut result = orchestrator.deploy_pending().await?;
    if result.success && result.rollback_available && !hold {
        // Nothing keeps the window open once this process exits.
        orchestrator.shutdown().await;
        result.rollback_available = false;
        result.previous_environment = None;
        info!("previous environment retired; pass --hold to keep a rollback window open");
    }
    println!("{}", formatter.format_deployment(&result));
    if !result.success {
        let phase = result
            .failed_phase
            .map(|p| p.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        eprintln!(
            "{}",
            formatter.format_error(&format!(
                "deployment failed during {}; {} remains operational",
                phase, result.active_environment
            ))
        );
        return Ok(CommandStatus::Failed);
    }

    if !result.rollback_available {
        return Ok(CommandStatus::Success);
    }

    let remaining = orchestrator
        .rollback_remaining()
        .map(|d| d.as_secs())
        .unwrap_or_default();
    eprintln!(
        "Holding rollback window for {}s. Press Ctrl+C to roll back.",
        remaining
    );

    tokio::select! {
        _ = orchestrator.wait_for_rollback_window() => {
            println!("{}", formatter.format_message("Rollback window closed"));
            Ok(CommandStatus::Success)
        }
        signal = tokio::signal::ctrl_c() => {
            signal?;
            let rolled_back = orchestrator.rollback().await?;
            println!("{}", formatter.format_deployment(&rolled_back));
            Ok(CommandStatus::Success)
        }
    }
}
