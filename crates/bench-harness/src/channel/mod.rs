//! Command channels: how a machine runs shell commands and receives files
//!
//! `LocalChannel` spawns `sh -c` on this host, `SshChannel` keeps a persistent
//! authenticated session to a remote host. Everything else in the harness
//! (docker invocations, file reads, address discovery) is expressed as
//! commands sent through a channel.

mod local;
mod ssh;

pub use local::LocalChannel;
pub use ssh::{SshChannel, SshTarget};

use anyhow::Result;
use async_trait::async_trait;
use bench_harness_common::defaults::ROUTE_PROBE_ADDR;
use std::path::Path;

/// Captured result of one shell command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// Exit status, if the channel reported one
    pub exit_code: Option<u32>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Executes commands on one host
#[async_trait]
pub trait CommandChannel: Send + Sync {
    /// Run a shell command and capture its output.
    ///
    /// A non-zero exit is not an error here; callers inspect `exit_code`.
    async fn run(&self, command: &str) -> Result<CommandOutput>;

    /// Copy a local directory tree to `remote_dir`, preserving relative paths.
    async fn send_dir(&self, local_dir: &Path, remote_dir: &str) -> Result<()>;

    /// Read a file on the host
    async fn read_file(&self, path: &str) -> Result<String> {
        let output = self.run(&format!("cat {}", shell_quote(path))).await?;
        if !output.success() {
            anyhow::bail!("Failed to read {}: {}", path, output.stderr.trim());
        }
        Ok(output.stdout)
    }

    /// Address other hosts can use to reach this one
    async fn source_address(&self) -> Result<String> {
        let output = self.run(&format!("ip route get {ROUTE_PROBE_ADDR}")).await?;
        parse_route_source(&output.stdout).ok_or_else(|| {
            anyhow::anyhow!(
                "No source address in route lookup: {}",
                output.stdout.trim()
            )
        })
    }
}

/// Extract the `src` address from `ip route get` output
pub fn parse_route_source(route: &str) -> Option<String> {
    let mut tokens = route.split_whitespace();
    while let Some(token) = tokens.next() {
        if token == "src" {
            return tokens
                .next()
                .filter(|addr| addr.parse::<std::net::IpAddr>().is_ok())
                .map(str::to_string);
        }
    }
    None
}

/// Quote a string for safe interpolation into a POSIX shell command
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=,@%+".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}
