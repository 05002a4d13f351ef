//! Deployment error types.

use thiserror::Error;

use crate::environment::EnvironmentName;
use crate::migration::MigrationError;

/// Errors that reject a deployment or rollback before it starts, or that
/// come from setting up the orchestrator.
///
/// Failures inside a started deployment are reported in
/// [`DeploymentResult`](super::DeploymentResult) instead.
#[derive(Debug, Error)]
pub enum DeployError {
    /// Another deployment or rollback holds the deployment slot.
    #[error("deployment already in progress")]
    DeploymentInProgress,

    /// No rollback window is open.
    #[error("rollback not available")]
    RollbackUnavailable,

    /// The plan cannot run as ordered.
    #[error("unmet migration dependencies: {}", messages.join("; "))]
    UnmetDependencies {
        /// One message per unmet dependency or duplicated version.
        messages: Vec<String>,
    },

    /// An environment failed its health probe.
    #[error("environment {name} is unhealthy")]
    EnvironmentUnhealthy {
        /// The failing environment.
        name: EnvironmentName,
    },

    /// No environment is active.
    #[error("no active environment")]
    NoActiveEnvironment,

    /// The base schema file could not be read.
    #[error("failed to read schema file {path}: {source}")]
    SchemaFile {
        /// Path from the configuration.
        path: String,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Migration error.
    #[error(transparent)]
    Migration(#[from] MigrationError),

    /// Storage error.
    #[error(transparent)]
    Storage(#[from] crate::error::Error),
}
