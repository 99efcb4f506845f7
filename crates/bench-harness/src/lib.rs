//! bench-harness - machine pools and container orchestration for benchmarks
//!
//! Drivers obtain machines from a `MachineProducer`, run workload containers
//! on them through `ContainerHandle`s and hand the machines back.

pub mod channel;
pub mod cloud;
pub mod config;
pub mod container;
pub mod error;
pub mod machine;
pub mod producer;
pub mod wait;

pub use container::{ContainerHandle, ContainerOptions, ContainerParams};
pub use error::{HarnessError, Result};
pub use machine::{Machine, MachineKind, MachineSettings};
pub use producer::{with_machines, CloudProducer, MachinePool, MachineProducer};
