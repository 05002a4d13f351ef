//! Blue and green environments.
//!
//! Each environment is one database file in the data directory with its own
//! connection pool. The registry tracks which of the two serves traffic.

pub mod copy;
pub mod handle;
pub mod registry;

pub use copy::{copy_all_tables, CopyReport, TableCopy};
pub use handle::{Environment, EnvironmentName, EnvironmentStatus, HealthStatus};
pub use registry::{DeploymentGuard, EnvironmentRegistry, RegistryState, STATE_FILE_NAME};
