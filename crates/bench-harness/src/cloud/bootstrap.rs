//! Bring up a named VM for a declarative pool entry
//!
//! The instance gets the entry's SSH public key and a startup script that
//! installs docker. It is usable once `docker run hello-world` succeeds over
//! SSH without printing anything to stderr.

use super::api::{ComputeApi, Instance};
use super::error::ProvisionError;
use super::provisioner::Provisioner;
use crate::channel::{CommandChannel, SshChannel, SshTarget};
use crate::config::PollingConfig;
use crate::error::Result;
use crate::machine::{Machine, MachineSettings};
use crate::wait::{poll_until, PollConfig};
use anyhow::Context;
use bench_harness_common::defaults::{BOOTSTRAP_POLL_INTERVAL, BOOTSTRAP_TIMEOUT, DEFAULT_SSH_PORT};
use bench_harness_common::CloudEntry;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Installs docker and grants the `docker-user` metadata user access to it
pub const DEFAULT_STARTUP_SCRIPT: &str = r#"#!/bin/sh
set -e
if ! command -v docker >/dev/null 2>&1; then
    curl -fsSL https://get.docker.com | sh
fi
user=$(curl -fs -H 'Metadata-Flavor: Google' \
    http://metadata.google.internal/computeMetadata/v1/instance/attributes/docker-user)
usermod -aG docker "$user"
"#;

const READY_PROBE: &str = "docker run --rm hello-world";

/// Metadata items for a bootstrapped instance
pub(crate) fn bootstrap_metadata(
    entry: &CloudEntry,
    public_key: &str,
    startup_script: &str,
) -> Vec<(String, String)> {
    vec![
        (
            "ssh-keys".to_string(),
            format!("{}:{}", entry.username, public_key.trim()),
        ),
        ("startup-script".to_string(), startup_script.to_string()),
        ("docker-user".to_string(), entry.username.clone()),
    ]
}

async fn read_text(path: &Path) -> Result<String> {
    Ok(tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?)
}

/// Create the entry's instance, wait for docker on it and return it as a
/// remote machine called `name`
pub async fn bootstrap(
    api: Arc<dyn ComputeApi>,
    name: &str,
    entry: &CloudEntry,
    settings: MachineSettings,
    polling: &PollingConfig,
) -> Result<Machine> {
    let key_path = entry.resolved_key_path();
    let public_key = read_text(&public_key_path(&key_path)).await?;
    let startup_script = match &entry.startup_script {
        Some(path) => read_text(path).await?,
        None => DEFAULT_STARTUP_SCRIPT.to_string(),
    };

    let provisioner = Provisioner::new(api, &entry.project, &entry.zone)
        .with_machine_type(&entry.machine_type)
        .with_operation_poll(polling.operation.clone());
    provisioner
        .set_image_from_family(&entry.image_project, &entry.image_family)
        .await?;

    info!(machine = %name, instance = %entry.instance_name, zone = %entry.zone, "Bootstrapping cloud machine");
    let instance = match provisioner
        .create_named(
            &entry.instance_name,
            bootstrap_metadata(entry, &public_key, &startup_script),
        )
        .await
    {
        Ok(instance) => instance,
        Err(e) => {
            if let Some(instance) = e.failed_instance() {
                provisioner.delete_quietly(instance).await;
            }
            return Err(e.into());
        }
    };

    match connect(name, &instance, entry, key_path, settings).await {
        Ok(machine) => Ok(machine),
        Err(e) => {
            warn!(machine = %name, instance = %instance.name, error = %e, "Bootstrap failed, deleting instance");
            provisioner.delete_quietly(&instance.name).await;
            Err(e)
        }
    }
}

/// Wait for docker on a created instance and wrap it as a remote machine
async fn connect(
    name: &str,
    instance: &Instance,
    entry: &CloudEntry,
    key_path: PathBuf,
    settings: MachineSettings,
) -> Result<Machine> {
    let host = instance
        .external_ip()
        .ok_or_else(|| ProvisionError::MissingExternalIp {
            instance: instance.name.clone(),
        })?
        .to_string();

    let target = SshTarget {
        host,
        port: DEFAULT_SSH_PORT,
        username: entry.username.clone(),
        key_path,
        key_password: None,
    };
    wait_for_docker(&target).await?;

    Machine::remote(name, target, settings).await
}

/// `<key>.pub`, keeping any existing extension (`id.PEM` -> `id.PEM.pub`)
pub(crate) fn public_key_path(key_path: &Path) -> PathBuf {
    match key_path.extension() {
        Some(ext) => key_path.with_extension(format!("{}.pub", ext.to_string_lossy())),
        None => key_path.with_extension("pub"),
    }
}

async fn wait_for_docker(target: &SshTarget) -> Result<()> {
    let channel = SshChannel::new(target.clone());
    let config = PollConfig::fixed(BOOTSTRAP_POLL_INTERVAL).with_timeout(BOOTSTRAP_TIMEOUT);
    let channel = &channel;

    poll_until(&config, &format!("docker on {}", target.host), || async move {
        match channel.run(READY_PROBE).await {
            Ok(output) if output.success() && output.stderr.trim().is_empty() => {
                Ok::<_, ProvisionError>(Some(()))
            }
            Ok(output) => {
                debug!(host = %target.host, stderr = %output.stderr.trim(), "Docker not ready");
                Ok(None)
            }
            Err(e) => {
                debug!(host = %target.host, error = %e, "SSH not ready");
                Ok(None)
            }
        }
    })
    .await?;

    info!(host = %target.host, "Docker ready");
    Ok(())
}
