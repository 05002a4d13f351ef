//! Deployment phases and reports.

use serde::Serialize;

use crate::environment::{CopyReport, EnvironmentName, EnvironmentStatus, HealthStatus};
use crate::migration::MigrationOutcome;

/// Where the orchestrator is in a deployment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentPhase {
    /// No deployment running and no rollback window open.
    #[default]
    Idle,
    /// Creating the target environment.
    PreparingTarget,
    /// Copying tables from the active environment.
    CopyingData,
    /// Running migrations on the target.
    ApplyingMigrations,
    /// Checking the target before the switch.
    Validating,
    /// Traffic moved to the target.
    Switched,
    /// The last deployment failed; the active environment is unchanged.
    Failed,
    /// The previous environment is kept for instant rollback.
    RollbackArmed,
    /// Traffic moved back to the previous environment.
    RolledBack,
}

impl DeploymentPhase {
    /// Check whether moving from `self` to `next` is allowed.
    pub fn can_transition_to(self, next: DeploymentPhase) -> bool {
        use DeploymentPhase::*;

        match (self, next) {
            (Idle | Failed | RolledBack | Switched | RollbackArmed, PreparingTarget) => true,
            (PreparingTarget, CopyingData) => true,
            (CopyingData, ApplyingMigrations) => true,
            (ApplyingMigrations, Validating) => true,
            (Validating, Switched) => true,
            (PreparingTarget | CopyingData | ApplyingMigrations | Validating, Failed) => true,
            (Switched, RollbackArmed) => true,
            (RollbackArmed, RolledBack) => true,
            (Switched | RollbackArmed | RolledBack | Failed, Idle) => true,
            _ => false,
        }
    }

    /// Whether a deployment is between start and switch.
    pub fn is_running(self) -> bool {
        matches!(
            self,
            DeploymentPhase::PreparingTarget
                | DeploymentPhase::CopyingData
                | DeploymentPhase::ApplyingMigrations
                | DeploymentPhase::Validating
        )
    }

    /// Lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            DeploymentPhase::Idle => "idle",
            DeploymentPhase::PreparingTarget => "preparing_target",
            DeploymentPhase::CopyingData => "copying_data",
            DeploymentPhase::ApplyingMigrations => "applying_migrations",
            DeploymentPhase::Validating => "validating",
            DeploymentPhase::Switched => "switched",
            DeploymentPhase::Failed => "failed",
            DeploymentPhase::RollbackArmed => "rollback_armed",
            DeploymentPhase::RolledBack => "rolled_back",
        }
    }
}

impl std::fmt::Display for DeploymentPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a deployment.
#[derive(Debug, Clone, Serialize)]
pub struct DeploymentResult {
    /// Whether traffic moved to the new environment.
    pub success: bool,
    /// Environment serving traffic after the call.
    pub active_environment: EnvironmentName,
    /// Environment kept for rollback, if any.
    pub previous_environment: Option<EnvironmentName>,
    /// Schema version of the active environment.
    pub schema_version: i64,
    /// Wall time of the deployment.
    pub duration_ms: u64,
    /// Whether an instant rollback is possible.
    pub rollback_available: bool,
    /// Error message of a failed deployment.
    pub error: Option<String>,
    /// Phase in which a failed deployment stopped.
    pub failed_phase: Option<DeploymentPhase>,
    /// Outcomes of the migrations that ran on the target.
    pub migrations: Vec<MigrationOutcome>,
    /// What the data copy did.
    pub copy: Option<CopyReport>,
}

/// Snapshot of both environments.
#[derive(Debug, Clone, Serialize)]
pub struct SystemHealth {
    /// Every present environment, blue first.
    pub environments: Vec<EnvironmentStatus>,
    /// Name of the active environment.
    pub active: Option<EnvironmentName>,
    /// Whether an instant rollback is possible.
    pub rollback_available: bool,
    /// Milliseconds left in the rollback window.
    pub rollback_remaining_ms: Option<u64>,
    /// Whether a deployment or rollback holds the deployment slot.
    pub deployment_in_progress: bool,
    /// Current orchestrator phase.
    pub phase: DeploymentPhase,
}

impl SystemHealth {
    /// Whether the active environment answered its last probe.
    pub fn is_healthy(&self) -> bool {
        self.environments
            .iter()
            .any(|e| e.active && e.health == HealthStatus::Healthy)
    }

    /// Status of the active environment.
    pub fn active_status(&self) -> Option<&EnvironmentStatus> {
        self.environments.iter().find(|e| e.active)
    }
}
