//! Container runtime capability consumed by `ContainerHandle`

use crate::wait::WaitTimeout;
use async_trait::async_trait;
use std::collections::BTreeMap;
use thiserror::Error;

/// Container runtime errors
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The instance does not exist (already exited and removed, or never created)
    #[error("No such container: {id}")]
    NotFound { id: String },

    /// The runtime itself failed to carry out the request
    #[error("Container runtime failed running `{command}` (exit {status:?}): {stderr}")]
    Failed {
        command: String,
        status: Option<u32>,
        stderr: String,
    },

    /// A synchronous run completed but the workload exited non-zero
    #[error("Container {image} exited with status {status}")]
    ExitStatus {
        image: String,
        status: u32,
        stdout: String,
        stderr: String,
    },

    /// The runtime answered with something we could not decode
    #[error("Unexpected runtime response: {0}")]
    Parse(String),

    /// An instance never reached the running state in time
    #[error(transparent)]
    Timeout(#[from] WaitTimeout),

    /// The command channel to the host failed
    #[error("Container runtime unreachable: {0}")]
    Channel(#[from] anyhow::Error),
}

impl RuntimeError {
    /// Check if this is a "not found" error (safe to ignore during teardown)
    pub fn is_not_found(&self) -> bool {
        matches!(self, RuntimeError::NotFound { .. })
    }
}

/// Everything the runtime needs to create one instance
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchSpec {
    pub image: String,
    /// OCI runtime to use (e.g. `runc`, `runsc`)
    pub runtime: String,
    /// Container port to publish on an ephemeral host port
    pub port: Option<u16>,
    /// `KEY=VALUE` pairs
    pub env: Vec<(String, String)>,
    pub options: ContainerOptions,
}

/// Pass-through creation options
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerOptions {
    /// Fixed container name (only meaningful with a single instance)
    pub name: Option<String>,
    /// `name -> alias` links to other containers
    pub links: BTreeMap<String, String>,
    /// `host_path -> container_path` bind mounts
    pub volumes: BTreeMap<String, String>,
    /// Paths mounted as tmpfs
    pub tmpfs: Vec<String>,
    pub network_mode: Option<String>,
    /// Include stderr in the output of a synchronous run
    pub capture_stderr: bool,
    /// Raw arguments appended to the runtime's create command
    pub extra_args: Vec<String>,
}

/// A started instance as reported by the runtime
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceRef {
    pub id: String,
    pub name: String,
}

/// Point-in-time view of an instance
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceState {
    pub running: bool,
    /// Container TCP port -> host port
    pub ports: BTreeMap<u16, u16>,
}

/// Operations a container runtime must support
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create an instance, wait for it to exit, remove it and return its output
    async fn run(&self, spec: &LaunchSpec) -> Result<String, RuntimeError>;

    /// Create and start an instance without waiting for it
    async fn start(&self, spec: &LaunchSpec) -> Result<InstanceRef, RuntimeError>;

    /// Query an instance's current state
    async fn inspect(&self, id: &str) -> Result<InstanceState, RuntimeError>;

    /// Forcibly terminate an instance
    async fn kill(&self, id: &str) -> Result<(), RuntimeError>;
}
