//! Recording command channel

use async_trait::async_trait;
use bench_harness::channel::{CommandChannel, CommandOutput};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// `CommandChannel` that succeeds without running anything.
///
/// Every command exits 0 with `stdout` as its output.
pub struct FakeChannel {
    address: String,
    stdout: String,
    commands: Mutex<Vec<String>>,
    sent: Mutex<Vec<(PathBuf, String)>>,
}

impl FakeChannel {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            stdout: String::new(),
            commands: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn with_stdout(mut self, stdout: impl Into<String>) -> Self {
        self.stdout = stdout.into();
        self
    }

    fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
        m.lock().unwrap()
    }

    /// Commands run so far, in order
    pub fn commands(&self) -> Vec<String> {
        Self::lock(&self.commands).clone()
    }

    /// `(local_dir, remote_dir)` pairs passed to `send_dir`
    pub fn sent(&self) -> Vec<(PathBuf, String)> {
        Self::lock(&self.sent).clone()
    }
}

#[async_trait]
impl CommandChannel for FakeChannel {
    async fn run(&self, command: &str) -> anyhow::Result<CommandOutput> {
        Self::lock(&self.commands).push(command.to_string());
        Ok(CommandOutput {
            stdout: self.stdout.clone(),
            stderr: String::new(),
            exit_code: Some(0),
        })
    }

    async fn send_dir(&self, local_dir: &Path, remote_dir: &str) -> anyhow::Result<()> {
        Self::lock(&self.sent).push((local_dir.to_path_buf(), remote_dir.to_string()));
        Ok(())
    }

    async fn source_address(&self) -> anyhow::Result<String> {
        Ok(self.address.clone())
    }
}
