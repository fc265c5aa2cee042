use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::info;

use super::{CommandOutput, CommandRunner, HostCommand, HostRunner};

/// Records every command and answers from a script instead of touching the host.
///
/// Responses are matched by the longest registered prefix of the command line;
/// unmatched commands succeed with their simulated stdout, if any. Files registered with
/// [`RecordingRunner::with_file`] back `exists` and `read_to_string`.
#[derive(Debug, Default)]
pub struct RecordingRunner {
    responses: Vec<(String, CommandOutput)>,
    files: HashMap<PathBuf, String>,
    log: Mutex<Vec<HostCommand>>,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commands starting with `prefix` succeed and print `stdout`.
    pub fn respond(mut self, prefix: &str, stdout: &str) -> Self {
        self.responses.push((
            prefix.to_string(),
            CommandOutput {
                status: 0,
                stdout: stdout.to_string(),
                stderr: String::new(),
            },
        ));
        self
    }

    /// Commands starting with `prefix` exit with `status` and print `stderr`.
    pub fn fail(mut self, prefix: &str, status: i32, stderr: &str) -> Self {
        self.responses.push((
            prefix.to_string(),
            CommandOutput {
                status,
                stdout: String::new(),
                stderr: stderr.to_string(),
            },
        ));
        self
    }

    pub fn with_file(mut self, path: impl Into<PathBuf>, contents: &str) -> Self {
        self.files.insert(path.into(), contents.to_string());
        self
    }

    /// Every command line seen so far, in order.
    pub fn commands(&self) -> Vec<String> {
        self.log
            .lock()
            .map(|log| log.iter().map(|c| c.to_string()).collect())
            .unwrap_or_default()
    }

    /// Command lines of commands not marked as queries.
    pub fn mutations(&self) -> Vec<String> {
        self.log
            .lock()
            .map(|log| {
                log.iter()
                    .filter(|c| !c.is_query())
                    .map(|c| c.to_string())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Command lines starting with `prefix`.
    pub fn matching(&self, prefix: &str) -> Vec<String> {
        self.commands()
            .into_iter()
            .filter(|c| c.starts_with(prefix))
            .collect()
    }

    fn record(&self, cmd: &HostCommand) -> CommandOutput {
        if let Ok(mut log) = self.log.lock() {
            log.push(cmd.clone());
        }

        let line = cmd.to_string();
        self.responses
            .iter()
            .enumerate()
            .filter(|(_, (prefix, _))| line.starts_with(prefix.as_str()))
            // Longest prefix wins; among equal prefixes the latest registration wins
            .max_by_key(|(idx, (prefix, _))| (prefix.len(), *idx))
            .map(|(_, (_, output))| output.clone())
            .unwrap_or_else(|| CommandOutput {
                status: 0,
                stdout: cmd.get_simulated_stdout().unwrap_or_default().to_string(),
                stderr: String::new(),
            })
    }
}

#[async_trait::async_trait]
impl CommandRunner for RecordingRunner {
    async fn output(&self, cmd: &HostCommand) -> Result<CommandOutput> {
        Ok(self.record(cmd))
    }

    async fn run_inherited(&self, cmd: &HostCommand) -> Result<i32> {
        Ok(self.record(cmd).status)
    }

    async fn exists(&self, path: &Path) -> bool {
        self.files.contains_key(path)
    }

    async fn read_to_string(&self, path: &Path) -> Result<String> {
        self.files
            .get(path)
            .cloned()
            .ok_or_else(|| anyhow!("reading {}: no such file", path.display()))
    }
}

/// Runs read-only queries on the host but only records mutating commands.
///
/// Queries and file reads go to the inner runner, the real host by default.
#[derive(Debug, Default)]
pub struct DryRunRunner<R = HostRunner> {
    inner: R,
    recorded: Mutex<Vec<String>>,
}

impl DryRunRunner {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<R: CommandRunner> DryRunRunner<R> {
    /// Answers queries from `inner` instead of the host.
    pub fn over(inner: R) -> Self {
        Self {
            inner,
            recorded: Mutex::new(Vec::new()),
        }
    }

    pub fn inner(&self) -> &R {
        &self.inner
    }

    /// Mutating command lines that would have run.
    pub fn recorded(&self) -> Vec<String> {
        self.recorded
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    fn record(&self, cmd: &HostCommand) {
        info!(command = %cmd, "dry run: skipping");
        if let Ok(mut recorded) = self.recorded.lock() {
            recorded.push(cmd.to_string());
        }
    }
}

#[async_trait::async_trait]
impl<R: CommandRunner> CommandRunner for DryRunRunner<R> {
    async fn output(&self, cmd: &HostCommand) -> Result<CommandOutput> {
        if cmd.is_query() {
            return self.inner.output(cmd).await;
        }
        self.record(cmd);
        Ok(CommandOutput {
            status: 0,
            stdout: cmd.get_simulated_stdout().unwrap_or_default().to_string(),
            stderr: String::new(),
        })
    }

    async fn run_inherited(&self, cmd: &HostCommand) -> Result<i32> {
        if cmd.is_query() {
            return self.inner.run_inherited(cmd).await;
        }
        self.record(cmd);
        Ok(0)
    }

    async fn exists(&self, path: &Path) -> bool {
        self.inner.exists(path).await
    }

    async fn read_to_string(&self, path: &Path) -> Result<String> {
        self.inner.read_to_string(path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_longest_prefix_wins() {
        let runner = RecordingRunner::new()
            .fail("ping", 1, "")
            .respond("ping -c 1 -W 1 10.0.0.9", "");

        let hit = runner
            .output(&HostCommand::new("ping").args(["-c", "1", "-W", "1", "10.0.0.9"]))
            .await
            .unwrap();
        assert!(hit.success());

        let miss = runner
            .output(&HostCommand::new("ping").args(["-c", "1", "-W", "1", "10.0.0.8"]))
            .await
            .unwrap();
        assert_eq!(miss.status, 1);
    }

    #[tokio::test]
    async fn test_mutations_exclude_queries() {
        let runner = RecordingRunner::new();
        runner
            .output(&HostCommand::new("ip").args(["route", "show"]).query())
            .await
            .unwrap();
        runner
            .output(&HostCommand::new("ip").args(["link", "add", "br0"]))
            .await
            .unwrap();

        assert_eq!(runner.commands().len(), 2);
        assert_eq!(runner.mutations(), vec!["ip link add br0".to_string()]);
    }

    #[tokio::test]
    async fn test_virtual_files() {
        let runner = RecordingRunner::new().with_file("/proc/cpuinfo", "flags: vmx");
        assert!(runner.exists(Path::new("/proc/cpuinfo")).await);
        assert!(!runner.exists(Path::new("/dev/vhost-net")).await);
        assert_eq!(
            runner.read_to_string(Path::new("/proc/cpuinfo")).await.unwrap(),
            "flags: vmx"
        );
    }

    #[tokio::test]
    async fn test_dry_run_uses_simulated_stdout() {
        let runner = DryRunRunner::new();
        let output = runner
            .output(&HostCommand::new("cat").arg("/sys/x").simulated_stdout("10:200"))
            .await
            .unwrap();
        assert_eq!(output.stdout, "10:200");
        assert_eq!(runner.recorded(), vec!["cat /sys/x".to_string()]);
    }

    #[tokio::test]
    async fn test_dry_run_forwards_queries_only() {
        let runner = DryRunRunner::over(
            RecordingRunner::new()
                .respond("ip route show", "default via 10.0.0.1 dev eth0")
                .with_file("/etc/resolv.conf", "nameserver 1.1.1.1"),
        );

        let route = runner
            .output(&HostCommand::new("ip").args(["route", "show"]).query())
            .await
            .unwrap();
        assert_eq!(route.stdout, "default via 10.0.0.1 dev eth0");
        runner
            .output(&HostCommand::new("ip").args(["link", "add", "br0"]))
            .await
            .unwrap();

        assert!(runner.exists(Path::new("/etc/resolv.conf")).await);
        assert_eq!(runner.recorded(), vec!["ip link add br0".to_string()]);
        assert!(runner.inner().mutations().is_empty());
    }
}
