//! Harness configuration loaded from JSON
//!
//! Every field has a default, so an empty object (or no file at all) yields a
//! usable configuration for local machines.

use crate::wait::PollConfig;
use anyhow::{Context, Result};
use bench_harness_common::defaults::{
    self, DEFAULT_CONTAINER_RUNTIME, DEFAULT_DOCKER_BINARY, DEFAULT_INSTANCE_PREFIX,
    DEFAULT_LOCAL_WORKLOADS_ROOT, DEFAULT_REMOTE_WORKLOADS_ROOT, DEFAULT_WAIT_TIMEOUT,
    OPERATION_POLL_INTERVAL, POOL_RECHECK_INTERVAL, READINESS_POLL_INTERVAL,
};
use serde::{Deserialize, Deserializer};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Where workload sources live and where they are staged on remote machines
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct WorkloadConfig {
    /// Local directory with one sub-directory (holding a Dockerfile) per workload
    pub local_root: PathBuf,
    /// Directory on remote machines workloads are copied into before building
    pub remote_root: String,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            local_root: PathBuf::from(DEFAULT_LOCAL_WORKLOADS_ROOT),
            remote_root: DEFAULT_REMOTE_WORKLOADS_ROOT.to_string(),
        }
    }
}

impl WorkloadConfig {
    pub fn local_dir(&self, workload: &str) -> PathBuf {
        self.local_root.join(workload)
    }

    pub fn remote_dir(&self, workload: &str) -> String {
        format!("{}/{}", self.remote_root.trim_end_matches('/'), workload)
    }
}

/// Container runtime selection
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Docker CLI binary on each machine
    pub docker_binary: String,
    /// OCI runtime used when a container does not name one
    pub default_runtime: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            docker_binary: DEFAULT_DOCKER_BINARY.to_string(),
            default_runtime: DEFAULT_CONTAINER_RUNTIME.to_string(),
        }
    }
}

/// Delay policies for the harness's waits
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    /// Container instances reaching the running state
    pub readiness: PollConfig,
    /// Cloud operations reaching DONE
    pub operation: PollConfig,
    /// How often a blocked pool waiter re-checks without a wakeup (ms)
    #[serde(deserialize_with = "millis")]
    pub pool_recheck: Duration,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            readiness: PollConfig::fixed(READINESS_POLL_INTERVAL).with_timeout(DEFAULT_WAIT_TIMEOUT),
            operation: PollConfig::fixed(OPERATION_POLL_INTERVAL).with_timeout(DEFAULT_WAIT_TIMEOUT),
            pool_recheck: POOL_RECHECK_INTERVAL,
        }
    }
}

/// SSH credentials for reaching cloud instances
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SshCredentials {
    pub username: String,
    pub key_path: PathBuf,
    #[serde(default)]
    pub key_password: Option<String>,
}

/// Compute API settings for the cloud producer
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CloudConfig {
    pub project: String,
    pub zone: String,
    #[serde(default = "defaults::default_machine_type")]
    pub machine_type: String,
    /// Image name resolved with `set_image` before the first instance is created
    #[serde(default)]
    pub image: Option<String>,
    /// Project owning `image`; the instance project when unset
    #[serde(default)]
    pub image_project: Option<String>,
    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,
    /// Bearer token for the compute API; resolved from the environment when unset
    #[serde(default)]
    pub access_token: Option<String>,
    /// How to reach created instances over SSH
    #[serde(default)]
    pub ssh: Option<SshCredentials>,
}

fn default_name_prefix() -> String {
    DEFAULT_INSTANCE_PREFIX.to_string()
}

/// Top-level harness configuration
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    pub workloads: WorkloadConfig,
    pub runtime: RuntimeConfig,
    pub polling: PollingConfig,
    pub cloud: Option<CloudConfig>,
}

impl HarnessConfig {
    /// Load configuration from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load from `path` if given, defaults otherwise
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        path.map_or_else(|| Ok(Self::default()), Self::load)
    }

    /// The cloud section, or an error naming what is missing
    pub fn require_cloud(&self) -> Result<&CloudConfig> {
        self.cloud
            .as_ref()
            .context("Config has no `cloud` section")
    }
}

fn millis<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
    u64::deserialize(d).map(Duration::from_millis)
}
