//! Rollback window timer.
//!
//! After a switch the previous environment is kept for a bounded time. A
//! detached task sleeps for the window and then tears the previous
//! environment down. The task needs the deployment slot to do so; while the
//! slot is busy it keeps retrying until it gets the slot or is cancelled.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::state::DeploymentPhase;
use crate::environment::{EnvironmentName, EnvironmentRegistry};

/// Delay between attempts to take a busy deployment slot.
const SLOT_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// A running rollback window.
#[derive(Debug)]
pub struct RollbackWindow {
    previous: EnvironmentName,
    armed_at: Instant,
    duration: Duration,
    handle: JoinHandle<()>,
}

impl RollbackWindow {
    /// Start the timer for `previous`.
    ///
    /// When the window closes the previous environment is retired,
    /// `available` is set to false and an armed `phase` returns to idle.
    pub fn arm(
        registry: Arc<EnvironmentRegistry>,
        previous: EnvironmentName,
        duration: Duration,
        available: Arc<watch::Sender<bool>>,
        phase: Arc<Mutex<DeploymentPhase>>,
    ) -> Self {
        available.send_replace(true);
        let armed_at = Instant::now();
        let deadline = tokio::time::Instant::from_std(armed_at + duration);

        let handle = tokio::spawn(async move {
            debug!(environment = %previous, window_ms = duration.as_millis() as u64, "rollback window armed");
            tokio::time::sleep_until(deadline).await;

            loop {
                if let Some(_guard) = registry.try_begin_deployment() {
                    close_window(&registry, previous, &available, &phase);
                    return;
                }
                debug!(environment = %previous, "deployment slot busy, retrying window cleanup");
                tokio::time::sleep(SLOT_RETRY_INTERVAL).await;
            }
        });

        Self {
            previous,
            armed_at,
            duration,
            handle,
        }
    }

    /// Environment kept for rollback.
    pub fn previous(&self) -> EnvironmentName {
        self.previous
    }

    /// Whether the window duration has passed.
    pub fn is_expired(&self) -> bool {
        self.armed_at.elapsed() >= self.duration
    }

    /// Time left before the window closes.
    pub fn remaining(&self) -> Duration {
        self.duration.saturating_sub(self.armed_at.elapsed())
    }

    /// Whether the timer task has exited.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Stop the timer without touching any environment.
    pub fn cancel(self) {
        self.handle.abort();
        debug!(environment = %self.previous, "rollback window cancelled");
    }
}

/// Retire `previous` and mark rollback unavailable.
///
/// The caller must hold the deployment slot.
pub(crate) fn close_window(
    registry: &EnvironmentRegistry,
    previous: EnvironmentName,
    available: &watch::Sender<bool>,
    phase: &Mutex<DeploymentPhase>,
) {
    retire_environment(registry, previous);
    available.send_replace(false);

    let mut phase = phase.lock();
    if *phase == DeploymentPhase::RollbackArmed {
        *phase = DeploymentPhase::Idle;
    }
    info!(environment = %previous, "rollback window closed");
}

/// Unregister an inactive environment and delete its files.
pub(crate) fn retire_environment(registry: &EnvironmentRegistry, name: EnvironmentName) {
    let Some(env) = registry.retire(name) else {
        return;
    };
    if let Err(e) = env.teardown() {
        warn!(environment = %name, error = %e, "failed to tear down environment");
    }
}
