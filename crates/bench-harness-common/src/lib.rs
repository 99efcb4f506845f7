//! bench-harness-common - Shared types and defaults
//!
//! This crate holds the pieces shared by the harness library, its binary and
//! its test utilities, without pulling in the SSH, HTTP or container stacks.
//!
//! ## Modules
//!
//! - [`defaults`]: Default configuration values
//! - [`pool_spec`]: Declarative machine pool specification (YAML)

pub mod defaults;
pub mod pool_spec;

pub use pool_spec::{CloudEntry, MachineSpec, PoolSpec, PoolSpecError, RemoteEntry};
