//! Host command execution.
//!
//! Every action that touches the host (device creation, addressing, firewall
//! rules, launching helpers and QEMU itself) goes through a [`CommandRunner`].
//! [`HostRunner`] executes for real, [`DryRunRunner`] only records mutations,
//! and [`RecordingRunner`] serves scripted output for tests.

mod host;
mod recording;

pub use host::HostRunner;
pub use recording::{DryRunRunner, RecordingRunner};

use anyhow::{Context, Result};
use std::fmt;
use std::path::Path;
use tracing::debug;

use crate::error::LaunchError;

/// A single external command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostCommand {
    program: String,
    args: Vec<String>,
    query: bool,
    checked: bool,
    simulated_stdout: Option<String>,
}

impl HostCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            query: false,
            checked: true,
            simulated_stdout: None,
        }
    }

    /// Shorthand for `sh -c <script>`, for commands that need redirection or globbing.
    pub fn shell(script: impl Into<String>) -> Self {
        Self::new("sh").arg("-c").arg(script)
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Marks the command as read-only: it never changes host state.
    pub fn query(mut self) -> Self {
        self.query = true;
        self
    }

    /// A nonzero exit is reported in the output instead of raised.
    pub fn unchecked(mut self) -> Self {
        self.checked = false;
        self
    }

    /// Stdout reported by runners that record the command instead of running it.
    pub fn simulated_stdout(mut self, stdout: impl Into<String>) -> Self {
        self.simulated_stdout = Some(stdout.into());
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    pub fn is_query(&self) -> bool {
        self.query
    }

    pub fn is_checked(&self) -> bool {
        self.checked
    }

    pub fn get_simulated_stdout(&self) -> Option<&str> {
        self.simulated_stdout.as_deref()
    }
}

impl fmt::Display for HostCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Captured result of a command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Capability to act on the host.
#[async_trait::async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run the command to completion, capturing stdout and stderr.
    async fn output(&self, cmd: &HostCommand) -> Result<CommandOutput>;

    /// Run the command with inherited stdio and return its exit code.
    async fn run_inherited(&self, cmd: &HostCommand) -> Result<i32>;

    async fn exists(&self, path: &Path) -> bool {
        tokio::fs::metadata(path).await.is_ok()
    }

    async fn read_to_string(&self, path: &Path) -> Result<String> {
        tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))
    }
}

/// Runs `cmd` capturing its output; a checked command that exits nonzero
/// becomes [`LaunchError::Command`].
pub async fn sh(runner: &dyn CommandRunner, cmd: HostCommand) -> Result<CommandOutput> {
    debug!(command = %cmd, "exec");
    let output = runner.output(&cmd).await?;
    if cmd.is_checked() && !output.success() {
        return Err(LaunchError::Command {
            command: cmd.to_string(),
            status: output.status,
            stderr: output.stderr.trim().to_string(),
        }
        .into());
    }
    Ok(output)
}

/// Runs `cmd` with the terminal attached and returns its exit code.
pub async fn sh_inherit(runner: &dyn CommandRunner, cmd: HostCommand) -> Result<i32> {
    debug!(command = %cmd, "exec (inherited stdio)");
    let status = runner.run_inherited(&cmd).await?;
    if cmd.is_checked() && status != 0 {
        return Err(LaunchError::Command {
            command: cmd.to_string(),
            status,
            stderr: String::new(),
        }
        .into());
    }
    Ok(status)
}

/// Runs a read-only command and returns its trimmed stdout.
pub async fn query_stdout(runner: &dyn CommandRunner, cmd: HostCommand) -> Result<String> {
    let output = sh(runner, cmd.query()).await?;
    Ok(output.stdout.trim().to_string())
}
