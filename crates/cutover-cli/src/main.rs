//! Cutover Command-Line Client
//!
//! Deploys schema migrations to SQLite databases with blue-green switching.

mod commands;
mod formatter;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use commands::{CliError, Command};
use cutover_core::migration::executor::DEFAULT_APPLIED_BY;
use cutover_core::{DeployConfig, MigrationConfig, PoolConfig};
use formatter::{create_formatter, Formatter, OutputFormat};
use tracing_subscriber::EnvFilter;

/// Blue-green schema deployments for SQLite
#[derive(Parser, Debug)]
#[command(name = "cutover")]
#[command(version, about = "Blue-green schema deployments for SQLite")]
pub struct Args {
    /// Directory holding the environment databases
    #[arg(short = 'd', long, default_value = "data", global = true)]
    pub data_dir: PathBuf,

    /// Directory holding migration definition files
    #[arg(short = 'm', long, default_value = "migrations", global = true)]
    pub migrations_dir: PathBuf,

    /// Base schema SQL file applied to every new environment
    #[arg(long, global = true)]
    pub schema: Option<PathBuf>,

    /// Table whose row count must survive a deployment (repeatable)
    #[arg(long = "core-table", global = true)]
    pub core_tables: Vec<String>,

    /// Seconds the previous environment is kept for instant rollback
    #[arg(long, default_value_t = 300, global = true)]
    pub rollback_window_secs: u64,

    /// Per-statement timeout in seconds
    #[arg(long, default_value_t = 30, global = true)]
    pub statement_timeout_secs: u64,

    /// Maximum connections per environment
    #[arg(long, default_value_t = 4, global = true)]
    pub max_connections: usize,

    /// Name recorded in the ledger for applied migrations
    #[arg(long, default_value = DEFAULT_APPLIED_BY, global = true)]
    pub applied_by: String,

    /// Output format
    #[arg(long, default_value = "table", value_enum, global = true)]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub command: Command,
}

impl Args {
    /// Build the orchestrator configuration from the flags.
    pub fn deploy_config(&self) -> Result<DeployConfig, CliError> {
        if self.statement_timeout_secs == 0 {
            return Err(CliError::InvalidArgument {
                flag: "statement-timeout-secs",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.max_connections == 0 {
            return Err(CliError::InvalidArgument {
                flag: "max-connections",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.applied_by.trim().is_empty() {
            return Err(CliError::InvalidArgument {
                flag: "applied-by",
                reason: "must not be blank".to_string(),
            });
        }

        let pool = PoolConfig::default()
            .with_max_connections(self.max_connections)
            .with_statement_timeout(Duration::from_secs(self.statement_timeout_secs));
        let mut config = DeployConfig::new(&self.data_dir)
            .with_pool_config(pool)
            .with_core_tables(self.core_tables.iter().cloned())
            .with_rollback_window(Duration::from_secs(self.rollback_window_secs))
            .with_migration_config(MigrationConfig::default().with_applied_by(self.applied_by.trim()));
        if let Some(schema) = &self.schema {
            config = config.with_schema_file(schema);
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Logs go to stderr so JSON output stays parseable
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("cutover=info,cutover_core=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let formatter = create_formatter(args.format);

    match run(&args, formatter.as_ref()).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{}", formatter.format_error(&e.to_string()));
            ExitCode::FAILURE
        }
    }
}

async fn run(
    args: &Args,
    formatter: &dyn Formatter,
) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let config = args.deploy_config()?;
    let status = commands::execute(&args.command, config, &args.migrations_dir, formatter).await?;
    Ok(status.into())
}
