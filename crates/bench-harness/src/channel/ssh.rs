//! SSH command channel over a persistent russh session

use super::{shell_quote, CommandChannel, CommandOutput};
use anyhow::{Context, Result};
use async_trait::async_trait;
use bench_harness_common::RemoteEntry;
use russh::client;
use russh::{Channel, ChannelMsg};
use russh_keys::key::PublicKey;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};
use walkdir::WalkDir;

/// Where and as whom to connect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub key_path: PathBuf,
    pub key_password: Option<String>,
}

impl From<&RemoteEntry> for SshTarget {
    fn from(entry: &RemoteEntry) -> Self {
        Self {
            host: entry.hostname.clone(),
            port: entry.port,
            username: entry.username.clone(),
            key_path: entry.key_path.clone(),
            key_password: entry.key_password.clone(),
        }
    }
}

/// Benchmark hosts are ephemeral, so any host key is accepted.
struct AcceptAnyHostKey;

#[async_trait]
impl client::Handler for AcceptAnyHostKey {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Runs commands on a remote host over one long-lived SSH session.
///
/// The session is opened on first use and re-opened if the server closed it.
pub struct SshChannel {
    target: SshTarget,
    connect_timeout: Duration,
    session: Mutex<Option<client::Handle<AcceptAnyHostKey>>>,
}

impl SshChannel {
    pub fn new(target: SshTarget) -> Self {
        Self {
            target,
            connect_timeout: Duration::from_secs(30),
            session: Mutex::new(None),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn target(&self) -> &SshTarget {
        &self.target
    }

    async fn connect(&self) -> Result<client::Handle<AcceptAnyHostKey>> {
        let target = &self.target;
        let key = russh_keys::load_secret_key(&target.key_path, target.key_password.as_deref())
            .with_context(|| format!("Failed to load private key {}", target.key_path.display()))?;

        let config = Arc::new(client::Config::default());
        let mut session = tokio::time::timeout(
            self.connect_timeout,
            client::connect(config, (target.host.as_str(), target.port), AcceptAnyHostKey),
        )
        .await
        .with_context(|| format!("Connection timeout to {}:{}", target.host, target.port))?
        .with_context(|| format!("Failed to connect to {}:{}", target.host, target.port))?;

        let authenticated = session
            .authenticate_publickey(&target.username, Arc::new(key))
            .await
            .context("Public key authentication failed")?;
        if !authenticated {
            anyhow::bail!(
                "Authentication rejected for {}@{}",
                target.username,
                target.host
            );
        }

        info!(host = %target.host, user = %target.username, "SSH session established");
        Ok(session)
    }

    async fn open_channel(&self) -> Result<Channel<client::Msg>> {
        let mut session = self.session.lock().await;
        let stale = session.as_ref().map_or(true, |s| s.is_closed());
        if stale {
            *session = Some(self.connect().await?);
        }
        match session.as_ref() {
            Some(handle) => Ok(handle.channel_open_session().await?),
            None => anyhow::bail!("SSH session to {} unavailable", self.target.host),
        }
    }

    async fn upload(&self, content: &[u8], remote_path: &str) -> Result<()> {
        let mut channel = self.open_channel().await?;
        channel
            .exec(true, format!("cat > {}", shell_quote(remote_path)))
            .await?;
        channel.data(content).await?;
        channel.eof().await?;

        let mut exit_code = None;
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::ExitStatus { exit_status } => exit_code = Some(exit_status),
                ChannelMsg::Close => break,
                _ => {}
            }
        }
        match exit_code {
            Some(0) | None => Ok(()),
            Some(code) => anyhow::bail!("Writing {} exited with {}", remote_path, code),
        }
    }
}

#[async_trait]
impl CommandChannel for SshChannel {
    async fn run(&self, command: &str) -> Result<CommandOutput> {
        debug!(host = %self.target.host, cmd = %command, "Running remote command");

        let mut channel = self.open_channel().await?;
        channel.exec(true, command).await?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_code = None;

        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { data } => stdout.extend_from_slice(&data),
                // Extended data stream 1 is stderr.
                ChannelMsg::ExtendedData { data, ext: 1 } => stderr.extend_from_slice(&data),
                ChannelMsg::ExitStatus { exit_status } => exit_code = Some(exit_status),
                ChannelMsg::Close => break,
                _ => {}
            }
        }

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code,
        })
    }

    async fn send_dir(&self, local_dir: &Path, remote_dir: &str) -> Result<()> {
        info!(
            host = %self.target.host,
            src = %local_dir.display(),
            dest = %remote_dir,
            "Sending directory"
        );

        for entry in WalkDir::new(local_dir) {
            let entry = entry.with_context(|| format!("Failed to walk {}", local_dir.display()))?;
            let relative = entry
                .path()
                .strip_prefix(local_dir)
                .context("walkdir yielded a path outside its root")?;
            let dest = remote_join(remote_dir, relative);

            if entry.file_type().is_dir() {
                let output = self.run(&format!("mkdir -p {}", shell_quote(&dest))).await?;
                if !output.success() {
                    anyhow::bail!("mkdir {} failed: {}", dest, output.stderr.trim());
                }
            } else {
                let content = tokio::fs::read(entry.path())
                    .await
                    .with_context(|| format!("Failed to read {}", entry.path().display()))?;
                self.upload(&content, &dest).await?;
            }
        }
        Ok(())
    }
}

/// Join a local relative path onto a remote directory using `/` separators
fn remote_join(remote_dir: &str, relative: &Path) -> String {
    let mut joined = remote_dir.trim_end_matches('/').to_string();
    for component in relative.components() {
        joined.push('/');
        joined.push_str(&component.as_os_str().to_string_lossy());
    }
    joined
}
