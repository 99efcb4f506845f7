//! Execution targets
//!
//! A `Machine` is one host the harness can run commands and containers on.
//! Local, remote and cloud machines differ only in the command channel they
//! are built with; containers on all of them go through the same docker CLI
//! runtime.

use crate::channel::{shell_quote, CommandChannel, CommandOutput, LocalChannel, SshChannel, SshTarget};
use crate::cloud::{Instance, ProvisionError};
use crate::config::{HarnessConfig, WorkloadConfig};
use crate::container::{ContainerHandle, ContainerParams, ContainerRuntime, DockerCli};
use crate::error::{HarnessError, Result};
use crate::wait::PollConfig;
use bench_harness_common::defaults::DEFAULT_SSH_PORT;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info};

/// Which kind of host a machine is
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MachineKind {
    /// The host the harness runs on
    Local,
    /// A host reached over SSH
    Remote,
    /// A provisioned VM, reached over SSH
    Cloud { instance: Instance },
}

/// Per-machine settings taken from the harness configuration
#[derive(Debug, Clone, PartialEq)]
pub struct MachineSettings {
    pub workloads: WorkloadConfig,
    pub docker_binary: String,
    pub default_runtime: String,
    pub readiness: PollConfig,
}

impl Default for MachineSettings {
    fn default() -> Self {
        Self::from(&HarnessConfig::default())
    }
}

impl From<&HarnessConfig> for MachineSettings {
    fn from(config: &HarnessConfig) -> Self {
        Self {
            workloads: config.workloads.clone(),
            docker_binary: config.runtime.docker_binary.clone(),
            default_runtime: config.runtime.default_runtime.clone(),
            readiness: config.polling.readiness.clone(),
        }
    }
}

/// A host that runs shell commands and containers
pub struct Machine {
    name: String,
    kind: MachineKind,
    channel: Arc<dyn CommandChannel>,
    runtime: Arc<dyn ContainerRuntime>,
    settings: MachineSettings,
    address: OnceCell<String>,
}

impl std::fmt::Debug for Machine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Machine")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("address", &self.address.get())
            .finish_non_exhaustive()
    }
}

impl Machine {
    /// Assemble a machine from its channel and runtime
    pub fn from_parts(
        name: impl Into<String>,
        kind: MachineKind,
        channel: Arc<dyn CommandChannel>,
        runtime: Arc<dyn ContainerRuntime>,
        settings: MachineSettings,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            channel,
            runtime,
            settings,
            address: OnceCell::new(),
        }
    }

    fn over_channel(
        name: impl Into<String>,
        kind: MachineKind,
        channel: Arc<dyn CommandChannel>,
        settings: MachineSettings,
    ) -> Self {
        let runtime = Arc::new(DockerCli::new(Arc::clone(&channel), &settings.docker_binary));
        Self::from_parts(name, kind, channel, runtime, settings)
    }

    /// The host the harness runs on
    pub fn local(name: impl Into<String>, settings: MachineSettings) -> Self {
        Self::over_channel(name, MachineKind::Local, Arc::new(LocalChannel::new()), settings)
    }

    /// A host reached over SSH; the connection is checked before returning
    pub async fn remote(name: impl Into<String>, target: SshTarget, settings: MachineSettings) -> Result<Self> {
        let machine = Self::over_channel(name, MachineKind::Remote, Arc::new(SshChannel::new(target)), settings);
        machine.validate().await?;
        Ok(machine)
    }

    /// A provisioned VM reached over SSH at its external address.
    ///
    /// The session is opened on first use, so a VM that is still booting is
    /// not an error here.
    pub fn cloud(
        instance: Instance,
        username: impl Into<String>,
        key_path: impl Into<std::path::PathBuf>,
        key_password: Option<String>,
        settings: MachineSettings,
    ) -> Result<Self> {
        let host = instance
            .external_ip()
            .ok_or_else(|| ProvisionError::MissingExternalIp {
                instance: instance.name.clone(),
            })?
            .to_string();
        let target = SshTarget {
            host,
            port: DEFAULT_SSH_PORT,
            username: username.into(),
            key_path: key_path.into(),
            key_password,
        };

        let name = instance.name.clone();
        Ok(Self::over_channel(
            name,
            MachineKind::Cloud { instance },
            Arc::new(SshChannel::new(target)),
            settings,
        ))
    }

    async fn validate(&self) -> Result<()> {
        self.checked_run("true").await?;
        info!(machine = %self.name, "Machine reachable");
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &MachineKind {
        &self.kind
    }

    pub fn is_local(&self) -> bool {
        self.kind == MachineKind::Local
    }

    /// Backing cloud instance, for cloud machines
    pub fn instance(&self) -> Option<&Instance> {
        match &self.kind {
            MachineKind::Cloud { instance } => Some(instance),
            _ => None,
        }
    }

    pub fn channel(&self) -> &Arc<dyn CommandChannel> {
        &self.channel
    }

    /// Run a shell command; a non-zero exit is reported in the output, not as an error
    pub async fn run(&self, command: &str) -> Result<CommandOutput> {
        Ok(self.channel.run(command).await?)
    }

    /// Run a shell command and fail on a non-zero exit
    pub async fn checked_run(&self, command: &str) -> Result<CommandOutput> {
        let output = self.run(command).await?;
        if !output.success() {
            return Err(HarnessError::Command {
                machine: self.name.clone(),
                command: command.to_string(),
                status: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(output)
    }

    /// Contents of a file on this machine
    pub async fn read(&self, path: &str) -> Result<String> {
        Ok(self.channel.read_file(path).await?)
    }

    /// Build the named workload into an image on this machine and return its tag.
    ///
    /// Remote machines first receive a copy of the workload directory.
    pub async fn pull(&self, workload: &str) -> Result<String> {
        if workload.is_empty() || workload.contains('/') || workload.starts_with('.') {
            return Err(HarnessError::precondition(format!(
                "invalid workload name {workload:?}"
            )));
        }
        let local_dir = self.settings.workloads.local_dir(workload);
        if !tokio::fs::metadata(&local_dir).await.is_ok_and(|m| m.is_dir()) {
            return Err(HarnessError::precondition(format!(
                "no workload directory at {}",
                local_dir.display()
            )));
        }

        let build_dir = if self.is_local() {
            local_dir.display().to_string()
        } else {
            let remote_dir = self.settings.workloads.remote_dir(workload);
            self.channel.send_dir(&local_dir, &remote_dir).await?;
            remote_dir
        };

        info!(machine = %self.name, workload = %workload, "Building workload image");
        let command = format!(
            "{} build --tag={} {}",
            shell_quote(&self.settings.docker_binary),
            shell_quote(workload),
            shell_quote(&build_dir)
        );
        self.checked_run(&command).await?;
        debug!(machine = %self.name, tag = %workload, "Workload image built");
        Ok(workload.to_string())
    }

    /// Address peers use to reach this machine, looked up once
    pub async fn address(&self) -> Result<String> {
        let address = self
            .address
            .get_or_try_init(|| self.channel.source_address())
            .await?;
        Ok(address.clone())
    }

    /// Describe containers of `image` on this machine; nothing is started
    pub async fn container(&self, image: &str, params: ContainerParams) -> Result<ContainerHandle> {
        let mut params = params;
        if params.runtime.is_none() {
            params.runtime = Some(self.settings.default_runtime.clone());
        }
        let host = self.address().await?;
        Ok(ContainerHandle::new(image, host, Arc::clone(&self.runtime), params)?
            .with_readiness(self.settings.readiness.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bench_harness_common::defaults::{DEFAULT_CONTAINER_RUNTIME, DEFAULT_DOCKER_BINARY};
    use std::path::Path;
    use std::sync::Mutex;

    /// Channel that succeeds on everything and records what it was asked
    #[derive(Default)]
    struct Recorder {
        commands: Mutex<Vec<String>>,
        sent: Mutex<Vec<(String, String)>>,
        fail: bool,
    }

    #[async_trait]
    impl CommandChannel for Recorder {
        async fn run(&self, command: &str) -> anyhow::Result<CommandOutput> {
            self.commands.lock().unwrap().push(command.to_string());
            Ok(CommandOutput {
                stdout: "10.0.0.9\n".into(),
                stderr: if self.fail { "no such file".into() } else { String::new() },
                exit_code: Some(if self.fail { 1 } else { 0 }),
            })
        }

        async fn send_dir(&self, local: &Path, remote: &str) -> anyhow::Result<()> {
            self.sent
                .lock()
                .unwrap()
                .push((local.display().to_string(), remote.to_string()));
            Ok(())
        }

        async fn source_address(&self) -> anyhow::Result<String> {
            self.commands.lock().unwrap().push("<address>".into());
            Ok("10.0.0.9".into())
        }
    }

    fn machine(kind: MachineKind, channel: Arc<Recorder>, settings: MachineSettings) -> Machine {
        Machine::over_channel("m1", kind, channel, settings)
    }

    fn workloads() -> (tempfile::TempDir, MachineSettings) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("redis")).unwrap();
        std::fs::write(dir.path().join("redis/Dockerfile"), "FROM redis\n").unwrap();
        let mut settings = MachineSettings::default();
        settings.workloads.local_root = dir.path().to_path_buf();
        settings.workloads.remote_root = "/tmp/staged".into();
        (dir, settings)
    }

    #[tokio::test]
    async fn remote_pull_stages_then_builds() {
        let (_dir, settings) = workloads();
        let channel = Arc::new(Recorder::default());
        let m = machine(MachineKind::Remote, channel.clone(), settings);

        assert_eq!(m.pull("redis").await.unwrap(), "redis");

        let sent = channel.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].0.ends_with("redis"));
        assert_eq!(sent[0].1, "/tmp/staged/redis");
        assert_eq!(
            channel.commands.lock().unwrap().as_slice(),
            ["docker build --tag=redis /tmp/staged/redis"]
        );
    }

    #[tokio::test]
    async fn local_pull_builds_in_place() {
        let (dir, settings) = workloads();
        let channel = Arc::new(Recorder::default());
        let m = machine(MachineKind::Local, channel.clone(), settings);

        m.pull("redis").await.unwrap();
        assert!(channel.sent.lock().unwrap().is_empty());
        let commands = channel.commands.lock().unwrap();
        assert!(commands[0].contains(&dir.path().join("redis").display().to_string()));
    }

    #[tokio::test]
    async fn failed_build_is_command_error() {
        let (_dir, settings) = workloads();
        let channel = Arc::new(Recorder {
            fail: true,
            ..Default::default()
        });
        let m = machine(MachineKind::Local, channel, settings);
        let err = m.pull("redis").await.unwrap_err();
        assert!(matches!(err, HarnessError::Command { status: Some(1), .. }));
    }

    #[tokio::test]
    async fn unknown_workload_is_rejected() {
        let (_dir, settings) = workloads();
        let m = machine(MachineKind::Local, Arc::new(Recorder::default()), settings);
        assert!(m.pull("missing").await.unwrap_err().is_precondition());
        assert!(m.pull("../etc").await.unwrap_err().is_precondition());
    }

    #[tokio::test]
    async fn address_is_looked_up_once() {
        let channel = Arc::new(Recorder::default());
        let m = machine(MachineKind::Remote, channel.clone(), MachineSettings::default());
        assert_eq!(m.address().await.unwrap(), "10.0.0.9");
        assert_eq!(m.address().await.unwrap(), "10.0.0.9");
        let lookups = channel
            .commands
            .lock()
            .unwrap()
            .iter()
            .filter(|c| *c == "<address>")
            .count();
        assert_eq!(lookups, 1);
    }

    #[tokio::test]
    async fn container_uses_default_runtime_and_machine_address() {
        let mut settings = MachineSettings::default();
        settings.default_runtime = "runsc".into();
        let m = machine(MachineKind::Remote, Arc::new(Recorder::default()), settings);

        let handle = m
            .container("nginx", ContainerParams::default().with_port(80))
            .await
            .unwrap();
        assert_eq!(handle.host(), "10.0.0.9");
        assert_eq!(handle.image(), "nginx");
        assert!(format!("{handle:?}").contains("runsc"));
    }

    #[tokio::test]
    async fn read_failure_surfaces() {
        let channel = Arc::new(Recorder {
            fail: true,
            ..Default::default()
        });
        let m = machine(MachineKind::Remote, channel, MachineSettings::default());
        assert!(m.read("/proc/meminfo").await.is_err());
    }

    #[test]
    fn cloud_machine_is_named_after_instance() {
        let instance: Instance = serde_json::from_value(serde_json::json!({
            "name": "machine-0042",
            "networkInterfaces": [{"accessConfigs": [{"natIP": "34.1.2.3"}]}]
        }))
        .unwrap();
        let m = Machine::cloud(instance, "bench", "/keys/bench", None, MachineSettings::default()).unwrap();
        assert_eq!(m.name(), "machine-0042");
        assert_eq!(m.instance().and_then(Instance::external_ip), Some("34.1.2.3"));
        assert!(!m.is_local());
    }

    #[test]
    fn cloud_machine_needs_external_ip() {
        let instance = Instance {
            name: "machine-7".into(),
            ..Default::default()
        };
        let err = Machine::cloud(instance, "bench", "/keys/bench", None, MachineSettings::default()).unwrap_err();
        assert!(matches!(
            err,
            HarnessError::Provision(ProvisionError::MissingExternalIp { .. })
        ));
    }

    #[test]
    fn default_settings_follow_defaults() {
        let settings = MachineSettings::default();
        assert_eq!(settings.docker_binary, DEFAULT_DOCKER_BINARY);
        assert_eq!(settings.default_runtime, DEFAULT_CONTAINER_RUNTIME);
    }
}
