//! Blue-green deployment.
//!
//! The orchestrator prepares the inactive environment, copies data into it,
//! applies migrations, validates, switches traffic and keeps the previous
//! environment around for a bounded rollback window.
//!
//! # Phases
//!
//! | Phase | Meaning |
//! |-------|---------|
//! | `idle` | Nothing running, no rollback window |
//! | `preparing_target` .. `validating` | Deployment in flight on the inactive side |
//! | `switched` | Traffic moved to the new environment |
//! | `rollback_armed` | Previous environment kept for instant rollback |
//! | `rolled_back` | Traffic moved back |
//! | `failed` | Deployment aborted, active environment untouched |

pub mod config;
pub mod error;
pub mod orchestrator;
pub mod state;
pub mod window;

pub use config::{DeployConfig, SchemaSource, DEFAULT_ROLLBACK_WINDOW};
pub use error::DeployError;
pub use orchestrator::BlueGreenOrchestrator;
pub use state::{DeploymentPhase, DeploymentResult, SystemHealth};
pub use window::RollbackWindow;
