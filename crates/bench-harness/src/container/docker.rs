//! Docker runtime driven through the docker CLI on the target machine
//!
//! Commands go through the machine's `CommandChannel`, so the same code
//! drives a local daemon and a daemon behind an SSH session.

use super::runtime::{ContainerRuntime, InstanceRef, InstanceState, LaunchSpec, RuntimeError};
use crate::channel::{shell_quote, CommandChannel, CommandOutput};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

/// Exit codes docker itself uses when it could not run the container
const DOCKER_RUN_FAILURES: &[u32] = &[125, 126, 127];

/// Daemon messages meaning the container is already gone
const GONE_MARKERS: &[&str] = &["No such container", "No such object", "is not running"];

fn is_gone(stderr: &str) -> bool {
    GONE_MARKERS.iter().any(|m| stderr.contains(m))
}

/// `ContainerRuntime` backed by the docker CLI
pub struct DockerCli {
    channel: Arc<dyn CommandChannel>,
    binary: String,
}

impl DockerCli {
    pub fn new(channel: Arc<dyn CommandChannel>, binary: impl Into<String>) -> Self {
        Self {
            channel,
            binary: binary.into(),
        }
    }

    fn command<S: AsRef<str>>(&self, args: &[S]) -> String {
        let mut cmd = shell_quote(&self.binary);
        for arg in args {
            cmd.push(' ');
            cmd.push_str(&shell_quote(arg.as_ref()));
        }
        cmd
    }

    async fn exec<S: AsRef<str>>(&self, args: &[S]) -> Result<(String, CommandOutput), RuntimeError> {
        let command = self.command(args);
        debug!(cmd = %command, "docker");
        let output = self.channel.run(&command).await?;
        Ok((command, output))
    }

    async fn inspect_record(&self, id: &str) -> Result<InspectRecord, RuntimeError> {
        let (command, output) = self.exec(&["inspect", "--type", "container", id]).await?;
        if !output.success() {
            if is_gone(&output.stderr) {
                return Err(RuntimeError::NotFound { id: id.to_string() });
            }
            return Err(failed(command, output));
        }

        let mut records: Vec<InspectRecord> = serde_json::from_str(&output.stdout)
            .map_err(|e| RuntimeError::Parse(format!("docker inspect {id}: {e}")))?;
        records
            .pop()
            .ok_or_else(|| RuntimeError::NotFound { id: id.to_string() })
    }
}

fn failed(command: String, output: CommandOutput) -> RuntimeError {
    RuntimeError::Failed {
        command,
        status: output.exit_code,
        stderr: output.stderr.trim().to_string(),
    }
}

/// Arguments for `docker run`, without the trailing image
pub(crate) fn run_args(spec: &LaunchSpec, detach: bool) -> Vec<String> {
    let mut args: Vec<String> = vec!["run".into(), "--rm".into()];
    if detach {
        args.push("--detach".into());
    }
    args.push(format!("--runtime={}", spec.runtime));
    if let Some(port) = spec.port {
        args.push("--publish".into());
        args.push(format!("{port}/tcp"));
    }
    for (key, value) in &spec.env {
        args.push("--env".into());
        args.push(format!("{key}={value}"));
    }

    let opts = &spec.options;
    if let Some(name) = &opts.name {
        args.push(format!("--name={name}"));
    }
    for (name, alias) in &opts.links {
        args.push(format!("--link={name}:{alias}"));
    }
    for (host, container) in &opts.volumes {
        args.push("--volume".into());
        args.push(format!("{host}:{container}"));
    }
    for path in &opts.tmpfs {
        args.push(format!("--tmpfs={path}"));
    }
    if let Some(mode) = &opts.network_mode {
        args.push(format!("--network={mode}"));
    }
    args.extend(opts.extra_args.iter().cloned());
    args.push(spec.image.clone());
    args
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn run(&self, spec: &LaunchSpec) -> Result<String, RuntimeError> {
        let (command, output) = self.exec(&run_args(spec, false)).await?;
        match output.exit_code {
            Some(0) => {
                let mut out = output.stdout;
                if spec.options.capture_stderr {
                    out.push_str(&output.stderr);
                }
                Ok(out)
            }
            Some(code) if !DOCKER_RUN_FAILURES.contains(&code) => Err(RuntimeError::ExitStatus {
                image: spec.image.clone(),
                status: code,
                stdout: output.stdout,
                stderr: output.stderr,
            }),
            _ => Err(failed(command, output)),
        }
    }

    async fn start(&self, spec: &LaunchSpec) -> Result<InstanceRef, RuntimeError> {
        let (command, output) = self.exec(&run_args(spec, true)).await?;
        if !output.success() {
            return Err(failed(command, output));
        }

        let id = output
            .stdout
            .lines()
            .last()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| RuntimeError::Parse("docker run printed no container id".into()))?
            .to_string();

        let name = match self.inspect_record(&id).await {
            Ok(record) => record.name.trim_start_matches('/').to_string(),
            // Exited and auto-removed before we could look; fall back to the short id.
            Err(RuntimeError::NotFound { .. }) => id.chars().take(12).collect(),
            Err(e) => return Err(e),
        };

        Ok(InstanceRef { id, name })
    }

    async fn inspect(&self, id: &str) -> Result<InstanceState, RuntimeError> {
        self.inspect_record(id).await.map(InspectRecord::into_state)
    }

    async fn kill(&self, id: &str) -> Result<(), RuntimeError> {
        let (command, output) = self.exec(&["kill", id]).await?;
        if output.success() {
            Ok(())
        } else if is_gone(&output.stderr) {
            Err(RuntimeError::NotFound { id: id.to_string() })
        } else {
            Err(failed(command, output))
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectRecord {
    name: String,
    state: InspectState,
    #[serde(default)]
    network_settings: Option<NetworkSettings>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectState {
    running: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct NetworkSettings {
    #[serde(default)]
    ports: Option<HashMap<String, Option<Vec<HostBinding>>>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HostBinding {
    host_port: String,
}

impl InspectRecord {
    fn into_state(self) -> InstanceState {
        let mut ports = BTreeMap::new();
        let bindings = self.network_settings.and_then(|n| n.ports).unwrap_or_default();
        for (key, bound) in bindings {
            let Some(container_port) = key
                .strip_suffix("/tcp")
                .and_then(|p| p.parse::<u16>().ok())
            else {
                continue;
            };
            let host_port = bound
                .unwrap_or_default()
                .into_iter()
                .find_map(|b| b.host_port.parse::<u16>().ok());
            if let Some(host_port) = host_port {
                ports.insert(container_port, host_port);
            }
        }

        InstanceState {
            running: self.state.running,
            ports,
        }
    }
}
