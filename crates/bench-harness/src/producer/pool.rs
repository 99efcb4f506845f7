//! Fixed-size machine pool with blocking checkout

use super::MachineProducer;
use crate::error::{HarnessError, Result};
use crate::machine::{Machine, MachineSettings};
use async_trait::async_trait;
use bench_harness_common::defaults::POOL_RECHECK_INTERVAL;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

struct Entry {
    machine: Arc<Machine>,
    checked_out: bool,
}

/// A fixed set of machines shared by concurrent drivers.
///
/// Machines are handed out in registration order among those available. A
/// caller asking for more than are free waits until enough are released;
/// asking for more than the pool holds fails immediately.
pub struct MachinePool {
    /// Never grows or shrinks after construction
    entries: Mutex<Vec<Entry>>,
    released: Notify,
    recheck_interval: Duration,
}

impl std::fmt::Debug for MachinePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MachinePool")
            .field("capacity", &self.capacity())
            .field("available", &self.available())
            .finish()
    }
}

impl MachinePool {
    pub fn new(machines: impl IntoIterator<Item = Machine>) -> Self {
        let entries = machines
            .into_iter()
            .map(|machine| Entry {
                machine: Arc::new(machine),
                checked_out: false,
            })
            .collect();
        Self {
            entries: Mutex::new(entries),
            released: Notify::new(),
            recheck_interval: POOL_RECHECK_INTERVAL,
        }
    }

    /// `count` machines all running on this host
    pub fn local(count: usize, settings: MachineSettings) -> Self {
        Self::new((0..count).map(|i| Machine::local(format!("local-{i}"), settings.clone())))
    }

    /// How often a waiter re-checks availability when no release wakes it
    pub fn with_recheck_interval(mut self, interval: Duration) -> Self {
        self.recheck_interval = interval;
        self
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Total number of machines
    pub fn capacity(&self) -> usize {
        self.lock().len()
    }

    /// Number of machines not checked out
    pub fn available(&self) -> usize {
        self.lock().iter().filter(|e| !e.checked_out).count()
    }

    /// Every machine in registration order, regardless of state
    pub fn machines(&self) -> Vec<Arc<Machine>> {
        self.lock().iter().map(|e| Arc::clone(&e.machine)).collect()
    }

    /// Check out the first `count` available entries if there are that many.
    ///
    /// Also reports whether anything is left for another waiter.
    fn try_checkout(&self, count: usize) -> Option<(Vec<Arc<Machine>>, bool)> {
        let mut entries = self.lock();
        let free: Vec<usize> = entries
            .iter()
            .enumerate()
            .filter(|(_, e)| !e.checked_out)
            .map(|(i, _)| i)
            .take(count)
            .collect();
        if free.len() < count {
            return None;
        }

        let machines = free
            .into_iter()
            .map(|i| {
                entries[i].checked_out = true;
                Arc::clone(&entries[i].machine)
            })
            .collect();
        let leftover = entries.iter().any(|e| !e.checked_out);
        Some((machines, leftover))
    }
}

#[async_trait]
impl MachineProducer for MachinePool {
    async fn get_machines(&self, count: usize) -> Result<Vec<Arc<Machine>>> {
        let capacity = self.capacity();
        if count > capacity {
            return Err(HarnessError::Capacity {
                requested: count,
                capacity,
            });
        }

        loop {
            // Register for wakeups before checking so a release in between is not missed.
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some((machines, leftover)) = self.try_checkout(count) {
                if leftover {
                    self.released.notify_one();
                }
                info!(
                    count,
                    machines = ?machines.iter().map(|m| m.name()).collect::<Vec<_>>(),
                    "Checked out machines"
                );
                return Ok(machines);
            }

            debug!(count, available = self.available(), "Waiting for machines");
            let _ = tokio::time::timeout(self.recheck_interval, notified).await;
        }
    }

    async fn release_machines(&self, machines: Vec<Arc<Machine>>) -> Result<()> {
        if machines.is_empty() {
            return Ok(());
        }

        let mut returned = 0;
        {
            let mut entries = self.lock();
            for machine in &machines {
                // Identity, not name: names are not unique within a pool.
                let entry = entries
                    .iter_mut()
                    .find(|e| e.checked_out && Arc::ptr_eq(&e.machine, machine));
                match entry {
                    Some(entry) => {
                        entry.checked_out = false;
                        returned += 1;
                    }
                    None => warn!(machine = %machine.name(), "Released machine was not checked out"),
                }
            }
        }

        if returned > 0 {
            info!(count = returned, "Released machines");
            self.released.notify_one();
        }
        Ok(())
    }
}
