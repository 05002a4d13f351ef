//! Registry of the blue and green environments.
//!
//! The registry owns the "active" pointer. Switching it and updating both
//! `is_active` flags happens under one write lock, so readers always see
//! exactly one active environment (or none before bootstrap).

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::handle::{Environment, EnvironmentName, EnvironmentStatus};
use crate::error::{Error, Result};

/// File in the data directory that records the active environment.
pub const STATE_FILE_NAME: &str = "cutover-state.json";

/// Persisted registry state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryState {
    /// The active environment.
    pub active: EnvironmentName,
    /// When the pointer last moved.
    pub updated_at: DateTime<Utc>,
}

impl RegistryState {
    /// Read the state file from `data_dir`, if there is one.
    pub fn load(data_dir: &Path) -> Result<Option<Self>> {
        let path = data_dir.join(STATE_FILE_NAME);
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_str(&text)?))
    }

    /// Write the state file into `data_dir` (temp file, then rename).
    pub fn save(&self, data_dir: &Path) -> Result<()> {
        let path = data_dir.join(STATE_FILE_NAME);
        let tmp = data_dir.join(format!("{}.tmp", STATE_FILE_NAME));
        std::fs::write(&tmp, serde_json::to_vec_pretty(self)?)?;
        std::fs::rename(&tmp, &path)?;
        debug!(path = %path.display(), active = %self.active, "registry state saved");
        Ok(())
    }
}

#[derive(Default)]
struct Slots {
    active: Option<EnvironmentName>,
    blue: Option<Arc<Environment>>,
    green: Option<Arc<Environment>>,
}

impl Slots {
    fn slot(&mut self, name: EnvironmentName) -> &mut Option<Arc<Environment>> {
        match name {
            EnvironmentName::Blue => &mut self.blue,
            EnvironmentName::Green => &mut self.green,
        }
    }

    fn get(&self, name: EnvironmentName) -> Option<&Arc<Environment>> {
        match name {
            EnvironmentName::Blue => self.blue.as_ref(),
            EnvironmentName::Green => self.green.as_ref(),
        }
    }
}

/// Tracks the two environments and which one is active.
pub struct EnvironmentRegistry {
    data_dir: PathBuf,
    slots: RwLock<Slots>,
    deployment_in_progress: AtomicBool,
}

impl EnvironmentRegistry {
    /// Create an empty registry for `data_dir`.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            slots: RwLock::new(Slots::default()),
            deployment_in_progress: AtomicBool::new(false),
        }
    }

    /// Data directory holding the environment files.
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// The active environment.
    pub fn active(&self) -> Option<Arc<Environment>> {
        let slots = self.slots.read();
        slots.active.and_then(|name| slots.get(name).cloned())
    }

    /// Name of the active environment.
    pub fn active_name(&self) -> Option<EnvironmentName> {
        self.slots.read().active
    }

    /// The environment registered under `name`.
    pub fn get(&self, name: EnvironmentName) -> Option<Arc<Environment>> {
        self.slots.read().get(name).cloned()
    }

    /// The environment that is present but not active.
    pub fn inactive(&self) -> Option<Arc<Environment>> {
        let slots = self.slots.read();
        let name = slots.active?.other();
        slots.get(name).cloned()
    }

    /// Register an environment, returning the one it replaces.
    ///
    /// The active environment cannot be replaced.
    pub fn install(&self, env: Arc<Environment>) -> Result<Option<Arc<Environment>>> {
        let mut slots = self.slots.write();
        let name = env.name();
        if slots.active == Some(name) {
            return Err(Error::InvalidData(format!(
                "cannot replace active environment {}",
                name
            )));
        }
        env.set_active(false);
        Ok(slots.slot(name).replace(env))
    }

    /// Unregister an inactive environment, returning it.
    ///
    /// Returns `None` when nothing is registered under `name` or when it is
    /// the active environment.
    pub fn retire(&self, name: EnvironmentName) -> Option<Arc<Environment>> {
        let mut slots = self.slots.write();
        if slots.active == Some(name) {
            warn!(environment = %name, "refusing to retire the active environment");
            return None;
        }
        slots.slot(name).take()
    }

    /// Make `name` the active environment.
    ///
    /// The pointer and both flags change together. Returns the previously
    /// active name.
    pub fn activate(&self, name: EnvironmentName) -> Result<Option<EnvironmentName>> {
        let previous = {
            let mut slots = self.slots.write();
            let target = slots
                .get(name)
                .cloned()
                .ok_or_else(|| Error::InvalidData(format!("environment {} is not registered", name)))?;
            if let Some(other) = slots.get(name.other()) {
                other.set_active(false);
            }
            target.set_active(true);
            slots.active.replace(name)
        };

        info!(
            active = %name,
            previous = previous.map(|p| p.as_str()).unwrap_or("none"),
            "active environment switched"
        );
        Ok(previous)
    }

    /// Write the active name to the state file.
    pub fn persist(&self) -> Result<()> {
        let Some(active) = self.active_name() else {
            return Ok(());
        };
        RegistryState {
            active,
            updated_at: Utc::now(),
        }
        .save(&self.data_dir)
    }

    /// Status of every registered environment, blue first.
    pub fn snapshot(&self) -> Vec<EnvironmentStatus> {
        let slots = self.slots.read();
        EnvironmentName::ALL
            .iter()
            .filter_map(|name| slots.get(*name).map(|env| env.status()))
            .collect()
    }

    /// Every registered environment, blue first.
    pub fn environments(&self) -> Vec<Arc<Environment>> {
        let slots = self.slots.read();
        EnvironmentName::ALL
            .iter()
            .filter_map(|name| slots.get(*name).cloned())
            .collect()
    }

    /// Claim the deployment slot.
    ///
    /// Returns `None` when a deployment or rollback already holds it. The
    /// slot is released when the guard drops.
    pub fn try_begin_deployment(&self) -> Option<DeploymentGuard<'_>> {
        self.deployment_in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| DeploymentGuard { registry: self })
    }

    /// Whether the deployment slot is held.
    pub fn is_deployment_in_progress(&self) -> bool {
        self.deployment_in_progress.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for EnvironmentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvironmentRegistry")
            .field("data_dir", &self.data_dir)
            .field("active", &self.active_name())
            .field("deployment_in_progress", &self.is_deployment_in_progress())
            .finish()
    }
}

/// Holds the deployment slot; releases it on drop.
pub struct DeploymentGuard<'a> {
    registry: &'a EnvironmentRegistry,
}

impl Drop for DeploymentGuard<'_> {
    fn drop(&mut self) {
        self.registry
            .deployment_in_progress
            .store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolConfig;

    fn env(dir: &Path, name: EnvironmentName) -> Arc<Environment> {
        Arc::new(Environment::create(dir, name, PoolConfig::default()).unwrap())
    }

    #[test]
    fn test_activate_flips_both_flags() {
        let dir = tempfile::tempdir().unwrap();
        let registry = EnvironmentRegistry::new(dir.path());
        let blue = env(dir.path(), EnvironmentName::Blue);
        let green = env(dir.path(), EnvironmentName::Green);
        registry.install(blue.clone()).unwrap();
        registry.install(green.clone()).unwrap();

        assert_eq!(registry.activate(EnvironmentName::Blue).unwrap(), None);
        assert!(blue.is_active() && !green.is_active());

        assert_eq!(
            registry.activate(EnvironmentName::Green).unwrap(),
            Some(EnvironmentName::Blue)
        );
        assert!(!blue.is_active() && green.is_active());
        assert_eq!(registry.active().unwrap().name(), EnvironmentName::Green);
        assert_eq!(registry.inactive().unwrap().name(), EnvironmentName::Blue);

        let active_count = registry.snapshot().iter().filter(|s| s.active).count();
        assert_eq!(active_count, 1);
    }

    #[test]
    fn test_activate_requires_registration() {
        let dir = tempfile::tempdir().unwrap();
        let registry = EnvironmentRegistry::new(dir.path());
        assert!(registry.activate(EnvironmentName::Green).is_err());
        assert!(registry.active().is_none());
    }

    #[test]
    fn test_active_cannot_be_replaced_or_retired() {
        let dir = tempfile::tempdir().unwrap();
        let registry = EnvironmentRegistry::new(dir.path());
        registry.install(env(dir.path(), EnvironmentName::Blue)).unwrap();
        registry.activate(EnvironmentName::Blue).unwrap();

        assert!(registry.retire(EnvironmentName::Blue).is_none());
        assert!(registry.get(EnvironmentName::Blue).is_some());

        let other_dir = tempfile::tempdir().unwrap();
        assert!(registry.install(env(other_dir.path(), EnvironmentName::Blue)).is_err());
    }

    #[test]
    fn test_deployment_guard_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let registry = EnvironmentRegistry::new(dir.path());

        let guard = registry.try_begin_deployment();
        assert!(guard.is_some());
        assert!(registry.is_deployment_in_progress());
        assert!(registry.try_begin_deployment().is_none());

        drop(guard);
        assert!(!registry.is_deployment_in_progress());
        assert!(registry.try_begin_deployment().is_some());
    }

    #[test]
    fn test_state_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        assert!(RegistryState::load(dir.path()).unwrap().is_none());

        let registry = EnvironmentRegistry::new(dir.path());
        registry.install(env(dir.path(), EnvironmentName::Green)).unwrap();
        registry.activate(EnvironmentName::Green).unwrap();
        registry.persist().unwrap();

        let state = RegistryState::load(dir.path()).unwrap().unwrap();
        assert_eq!(state.active, EnvironmentName::Green);
        assert!(!dir.path().join(format!("{}.tmp", STATE_FILE_NAME)).exists());
    }
}
