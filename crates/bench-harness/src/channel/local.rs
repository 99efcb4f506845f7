//! Command channel for the machine the harness runs on

use super::{CommandChannel, CommandOutput};
use anyhow::{Context, Result};
use async_trait::async_trait;
use bench_harness_common::defaults::ROUTE_PROBE_ADDR;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;
use walkdir::WalkDir;

/// Runs commands with `sh -c` on this host
#[derive(Debug, Clone, Default)]
pub struct LocalChannel;

impl LocalChannel {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandChannel for LocalChannel {
    async fn run(&self, command: &str) -> Result<CommandOutput> {
        debug!(cmd = %command, "Running local command");

        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .with_context(|| format!("Failed to spawn command: {}", command))?;

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().map(|c| c as u32),
        })
    }

    async fn send_dir(&self, local_dir: &Path, remote_dir: &str) -> Result<()> {
        let target = PathBuf::from(remote_dir);
        if local_dir == target.as_path() {
            return Ok(());
        }

        for entry in WalkDir::new(local_dir) {
            let entry = entry.with_context(|| format!("Failed to walk {}", local_dir.display()))?;
            let relative = entry
                .path()
                .strip_prefix(local_dir)
                .context("walkdir yielded a path outside its root")?;
            let dest = target.join(relative);

            if entry.file_type().is_dir() {
                tokio::fs::create_dir_all(&dest)
                    .await
                    .with_context(|| format!("Failed to create {}", dest.display()))?;
            } else {
                tokio::fs::copy(entry.path(), &dest)
                    .await
                    .with_context(|| format!("Failed to copy to {}", dest.display()))?;
            }
        }
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<String> {
        tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {}", path))
    }

    async fn source_address(&self) -> Result<String> {
        // Connecting a UDP socket sends nothing but makes the kernel pick a route.
        let socket = tokio::net::UdpSocket::bind("0.0.0.0:0")
            .await
            .context("Failed to bind probe socket")?;
        socket
            .connect((ROUTE_PROBE_ADDR, 80))
            .await
            .context("No route for address probe")?;
        Ok(socket.local_addr()?.ip().to_string())
    }
}
