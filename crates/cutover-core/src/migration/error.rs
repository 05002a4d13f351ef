//! Migration-specific error types.

use thiserror::Error;

/// Migration-specific errors.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// A migration definition failed validation.
    #[error("invalid migration {id:?}: {reason}")]
    InvalidDefinition {
        /// Migration id (may be empty when the id itself is missing).
        id: String,
        /// Why the definition was rejected.
        reason: String,
    },

    /// Two definitions share an id.
    #[error("duplicate migration id {id:?}")]
    DuplicateId {
        /// The id defined more than once.
        id: String,
    },

    /// Planning found dependencies that cannot be satisfied.
    #[error("unmet migration dependencies: {}", messages.join("; "))]
    UnmetDependencies {
        /// One message per unmet dependency.
        messages: Vec<String>,
    },

    /// A migration was about to run before one of its dependencies.
    #[error("migration {id} (v{version}) requires v{dependency}, which has not been applied")]
    DependencyNotApplied {
        /// The migration being executed.
        id: String,
        /// Its version.
        version: i64,
        /// The dependency missing from the ledger.
        dependency: i64,
    },

    /// A migration has no rollback SQL.
    #[error("migration {id} (v{version}) has no rollback SQL")]
    RollbackUnavailable {
        /// The migration id.
        id: String,
        /// Its version.
        version: i64,
    },

    /// The rollback target is not below the current version.
    #[error("cannot roll back to v{target}: current version is v{current}")]
    InvalidRollbackTarget {
        /// Requested target version.
        target: i64,
        /// Current schema version.
        current: i64,
    },

    /// The rollback plan carries risky operations and was not forced.
    #[error("rollback blocked by {} risky operation(s); use force to proceed: {}", risks.len(), risks.join("; "))]
    RiskyRollback {
        /// Risk messages from the rollback plan.
        risks: Vec<String>,
    },

    /// Migration not found.
    #[error("migration not found: {id}")]
    MigrationNotFound {
        /// The id that was looked up.
        id: String,
    },

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] crate::error::Error),

    /// IO error while reading or writing migration files.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Migration file could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for MigrationError {
    fn from(err: rusqlite::Error) -> Self {
        MigrationError::Storage(err.into())
    }
}
