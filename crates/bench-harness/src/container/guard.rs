//! Drop guard for started container instances

use super::runtime::ContainerRuntime;
use std::sync::Arc;
use tracing::{debug, warn};

/// Kills tracked instances when dropped while still armed.
///
/// `ContainerHandle::detach` kills its instances explicitly on every normal
/// exit path and then disarms the guard. If the `detach` future itself is
/// dropped mid-flight, the guard hands the tracked ids to a spawned task.
pub(crate) struct KillOnDrop {
    runtime: Arc<dyn ContainerRuntime>,
    ids: Vec<String>,
    armed: bool,
}

impl KillOnDrop {
    pub(crate) fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            runtime,
            ids: Vec::new(),
            armed: true,
        }
    }

    pub(crate) fn track(&mut self, id: impl Into<String>) {
        self.ids.push(id.into());
    }

    /// Stop tracking; dropping the guard afterwards does nothing
    pub(crate) fn disarm(mut self) {
        self.armed = false;
        self.ids.clear();
    }
}

impl Drop for KillOnDrop {
    fn drop(&mut self) {
        if !self.armed || self.ids.is_empty() {
            return;
        }

        let ids = std::mem::take(&mut self.ids);
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(instances = ?ids, "No async runtime to kill abandoned instances");
            return;
        };

        let runtime = Arc::clone(&self.runtime);
        handle.spawn(async move {
            for id in ids {
                match runtime.kill(&id).await {
                    Ok(()) => debug!(id = %id, "Killed abandoned instance"),
                    Err(e) if e.is_not_found() => {}
                    Err(e) => warn!(id = %id, error = %e, "Failed to kill abandoned instance"),
                }
            }
        });
    }
}
