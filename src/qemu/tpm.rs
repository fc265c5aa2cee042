//! Software TPM for Windows guests.

use anyhow::{Context, Result};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use super::opts::{QemuOpt, QemuOpts};
use crate::error::LaunchError;
use crate::exec::{sh, CommandRunner, HostCommand};

pub const TPM_STATE_DIR: &str = "/run/shm/tpm";
pub const TPM_PID_FILE: &str = "/var/run/tpm.pid";
pub const TPM_SOCKET: &str = "/run/swtpm-sock";

const SOCKET_POLL_ATTEMPTS: u32 = 6;
const SOCKET_POLL_INTERVAL: Duration = Duration::from_secs(1);

async fn wait_for_socket(runner: &dyn CommandRunner, sock: &Path) -> Result<()> {
    for attempt in 1..=SOCKET_POLL_ATTEMPTS {
        if runner.exists(sock).await {
            return Ok(());
        }
        debug!(attempt, "waiting for swtpm socket");
        if attempt < SOCKET_POLL_ATTEMPTS {
            tokio::time::sleep(SOCKET_POLL_INTERVAL).await;
        }
    }
    Err(LaunchError::environment(format!(
        "failed to start swtpm: {} did not appear",
        sock.display()
    )))
}

/// Starts a fresh swtpm daemon and wires it up as the guest's TPM 2.0.
pub async fn setup_swtpm(runner: &dyn CommandRunner, qemu: &mut QemuOpts) -> Result<()> {
    sh(runner, HostCommand::new("rm").args(["-rf", TPM_STATE_DIR])).await?;
    sh(runner, HostCommand::new("rm").args(["-f", TPM_PID_FILE])).await?;
    sh(runner, HostCommand::new("mkdir").args(["-m", "755", "-p", TPM_STATE_DIR])).await?;

    sh(
        runner,
        HostCommand::new("swtpm").args([
            "socket".to_string(),
            "-t".to_string(),
            "-d".to_string(),
            "--tpmstate".to_string(),
            format!("dir={}", TPM_STATE_DIR),
            "--ctrl".to_string(),
            format!("type=unixio,path={}", TPM_SOCKET),
            "--pid".to_string(),
            format!("file={}", TPM_PID_FILE),
            "--tpm2".to_string(),
        ]),
    )
    .await
    .context("starting swtpm")?;

    wait_for_socket(runner, Path::new(TPM_SOCKET)).await?;
    info!(socket = TPM_SOCKET, "swtpm running");

    qemu.append(QemuOpt::group(
        "chardev",
        "socket",
        [("id", "chrtpm"), ("path", TPM_SOCKET)],
    ));
    qemu.append(QemuOpt::group(
        "tpmdev",
        "emulator",
        [("id", "tpm0"), ("chardev", "chrtpm")],
    ));
    qemu.append(QemuOpt::group("device", "tpm-tis", [("tpmdev", "tpm0")]));
    Ok(())
}
