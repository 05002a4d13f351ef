//! Cutover Core - blue-green schema evolution for single-file SQLite databases.
//!
//! This crate keeps two environments, `blue` and `green`, as separate
//! database files. New migrations are applied to the inactive one, which is
//! validated and then made active in a single step.

pub mod deploy;
pub mod environment;
pub mod error;
pub mod migration;
pub mod pool;
pub mod sql;

pub use deploy::{
    BlueGreenOrchestrator, DeployConfig, DeployError, DeploymentPhase, DeploymentResult,
    SchemaSource, SystemHealth,
};
pub use environment::{
    CopyReport, Environment, EnvironmentName, EnvironmentRegistry, EnvironmentStatus, HealthStatus,
};
pub use error::{Error, Result};
pub use migration::{
    IntegrityIssue, LedgerEntry, Migration, MigrationCategory, MigrationConfig, MigrationError,
    MigrationExecutor, MigrationOutcome, MigrationPlan, MigrationPlanner, MigrationStatusReport,
    MigrationStore, RiskLevel, RollbackPlan,
};
pub use pool::{ConnectionPool, PoolConfig, QueryRows};
