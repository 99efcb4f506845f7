//! Default configuration values shared across bench-harness components

use std::time::Duration;

/// Container runtime used when a handle does not name one
pub const DEFAULT_CONTAINER_RUNTIME: &str = "runc";

/// Docker CLI binary invoked on every machine
pub const DEFAULT_DOCKER_BINARY: &str = "docker";

/// Prefix for cloud instances created by the cloud producer
pub const DEFAULT_INSTANCE_PREFIX: &str = "machine-";

/// Number of random digits appended to a cloud instance name
pub const INSTANCE_NAME_DIGITS: usize = 32;

/// Cloud machine type used when none is configured
pub const DEFAULT_MACHINE_TYPE: &str = "n1-standard-1";

/// Image project and family used to bootstrap declarative cloud entries
pub const DEFAULT_IMAGE_PROJECT: &str = "debian-cloud";
pub const DEFAULT_IMAGE_FAMILY: &str = "debian-9";

/// SSH port for remote machines
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Local directory holding one sub-directory per workload
pub const DEFAULT_LOCAL_WORKLOADS_ROOT: &str = "workloads";

/// Remote directory workloads are staged into before building
pub const DEFAULT_REMOTE_WORKLOADS_ROOT: &str = "/tmp/bench-harness/workloads";

/// How often a pool waiter re-checks availability without a wakeup
pub const POOL_RECHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Interval between container running-state checks
pub const READINESS_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Interval between cloud operation status checks
pub const OPERATION_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Upper bound on container readiness and cloud operation waits
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(600);

/// Interval and bound for waiting on a freshly bootstrapped VM's docker daemon
pub const BOOTSTRAP_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(180);

/// Address used to discover a machine's outbound source address
pub const ROUTE_PROBE_ADDR: &str = "8.8.8.8";

// Serde default functions for struct field defaults

/// Returns the default SSH port
pub fn default_ssh_port() -> u16 {
    DEFAULT_SSH_PORT
}

/// Returns the default machine type
pub fn default_machine_type() -> String {
    DEFAULT_MACHINE_TYPE.to_string()
}

/// Returns the default image project
pub fn default_image_project() -> String {
    DEFAULT_IMAGE_PROJECT.to_string()
}

/// Returns the default image family
pub fn default_image_family() -> String {
    DEFAULT_IMAGE_FAMILY.to_string()
}
