//! Versioned SQL migrations.
//!
//! This module provides ordered, dependency-checked schema evolution with:
//! - Definitions registered in code or loaded from a directory of JSON files
//! - Planning against the `schema_migrations` ledger of an environment
//! - Transactional execution, one migration at a time
//! - Planned rollbacks with risk flags
//! - Checksum drift detection
//!
//! # Example
//!
//! ```ignore
//! use cutover_core::migration::{MigrationConfig, MigrationExecutor, MigrationStore};
//!
//! let store = Arc::new(MigrationStore::load_dir("migrations")?);
//! let executor = MigrationExecutor::new(pool, store, MigrationConfig::default());
//! executor.initialize().await?;
//!
//! let plan = executor.create_migration_plan().await?;
//! println!("{} pending", plan.total_count);
//!
//! for outcome in executor.migrate().await? {
//!     println!("v{} {}", outcome.version, outcome.success);
//! }
//! ```

pub mod definition;
pub mod error;
pub mod executor;
pub mod integrity;
pub mod ledger;
pub mod plan;
pub mod store;

// Definition types
pub use definition::{Migration, MigrationCategory, RiskLevel, DEFAULT_ESTIMATED_TIME_MS};

// Error types
pub use error::MigrationError;

// Executor types
pub use executor::{MigrationConfig, MigrationExecutor, MigrationOutcome, MigrationStatusReport};

// Integrity types
pub use integrity::IntegrityIssue;

// Ledger types
pub use ledger::{LedgerEntry, LEDGER_TABLE};

// Plan types
pub use plan::{MigrationPlan, MigrationPlanner, RollbackPlan};

// Store types
pub use store::{scaffold, LoadFailure, MigrationStore};
