use anyhow::{Context, Result};
use std::process::Stdio;
use tokio::process::Command;

use super::{CommandOutput, CommandRunner, HostCommand};

/// Executes commands on the real host.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostRunner;

impl HostRunner {
    fn command(cmd: &HostCommand) -> Command {
        let mut c = Command::new(cmd.program());
        c.args(cmd.get_args());
        c
    }
}

#[async_trait::async_trait]
impl CommandRunner for HostRunner {
    async fn output(&self, cmd: &HostCommand) -> Result<CommandOutput> {
        let output = Self::command(cmd)
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("executing {}", cmd))?;

        Ok(CommandOutput {
            // Killed by a signal: no exit code, report as failure
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn run_inherited(&self, cmd: &HostCommand) -> Result<i32> {
        let status = Self::command(cmd)
            .status()
            .await
            .with_context(|| format!("executing {}", cmd))?;
        Ok(status.code().unwrap_or(-1))
    }
}
