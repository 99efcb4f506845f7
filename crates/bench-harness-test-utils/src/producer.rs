//! Producer with no capacity limit

use crate::{fake_machine, FakeRuntime};
use async_trait::async_trait;
use bench_harness::{Machine, MachineProducer, Result};
use std::sync::{Arc, Mutex};

/// Hands out as many fresh fake machines as asked for; release does nothing.
///
/// Machines are named `mock-<n>` across all calls, each with its own
/// `FakeRuntime`.
#[derive(Default)]
pub struct MockProducer {
    runtimes: Mutex<Vec<Arc<FakeRuntime>>>,
}

impl MockProducer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runtimes of every machine handed out so far, in creation order
    pub fn runtimes(&self) -> Vec<Arc<FakeRuntime>> {
        self.runtimes.lock().unwrap().clone()
    }
}

#[async_trait]
impl MachineProducer for MockProducer {
    async fn get_machines(&self, count: usize) -> Result<Vec<Arc<Machine>>> {
        let mut runtimes = self.runtimes.lock().unwrap();
        let machines = (0..count)
            .map(|_| {
                let n = runtimes.len();
                let runtime = Arc::new(FakeRuntime::new(format!("mock-{n}")));
                runtimes.push(Arc::clone(&runtime));
                Arc::new(fake_machine(&format!("mock-{n}"), "127.0.0.1", runtime))
            })
            .collect();
        Ok(machines)
    }

    async fn release_machines(&self, _machines: Vec<Arc<Machine>>) -> Result<()> {
        Ok(())
    }
}
