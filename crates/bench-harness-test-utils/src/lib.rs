//! Shared test utilities for bench-harness
//!
//! In-memory fakes for the two seams a `Machine` is built from, so pools and
//! container lifecycles can be exercised without docker or SSH.
//!
//! ## Modules
//!
//! - [`runtime`]: `FakeRuntime`, a recording `ContainerRuntime`
//! - [`channel`]: `FakeChannel`, a recording `CommandChannel`
//! - [`producer`]: `MockProducer`, an unbounded `MachineProducer`

pub mod channel;
pub mod producer;
pub mod runtime;

pub use channel::FakeChannel;
pub use producer::MockProducer;
pub use runtime::FakeRuntime;

use bench_harness::{Machine, MachineKind, MachinePool, MachineSettings};
use std::sync::Arc;

/// A local-kind machine backed by `runtime`, reachable at `address`
pub fn fake_machine(name: &str, address: &str, runtime: Arc<FakeRuntime>) -> Machine {
    Machine::from_parts(
        name,
        MachineKind::Local,
        Arc::new(FakeChannel::new(address)),
        runtime,
        MachineSettings::default(),
    )
}

/// A pool of `count` fake machines named `fake-<i>`, with their runtimes
pub fn fake_pool(count: usize) -> (MachinePool, Vec<Arc<FakeRuntime>>) {
    let runtimes: Vec<Arc<FakeRuntime>> = (0..count)
        .map(|i| Arc::new(FakeRuntime::new(format!("fake-{i}"))))
        .collect();
    let machines = runtimes
        .iter()
        .enumerate()
        .map(|(i, runtime)| {
            fake_machine(&format!("fake-{i}"), &format!("10.0.0.{}", i + 1), Arc::clone(runtime))
        })
        .collect::<Vec<_>>();
    (MachinePool::new(machines), runtimes)
}
