//! Queries about what the host and the QEMU build support.

use anyhow::{Context, Result};
use std::path::Path;
use tracing::{debug, warn};

use super::qemu_binary;
use crate::exec::{query_stdout, CommandRunner, HostCommand};

const CPUINFO: &str = "/proc/cpuinfo";

/// Machine types tried first, in order.
pub const PREFERRED_MACHINES: &[&str] = &["q35", "virt"];

/// Whether the CPU advertises hardware virtualization (Intel VT-x or AMD-V).
pub async fn is_kvm_available(runner: &dyn CommandRunner) -> bool {
    match runner.read_to_string(Path::new(CPUINFO)).await {
        Ok(cpuinfo) => cpuinfo
            .lines()
            .filter(|l| l.starts_with("flags"))
            .flat_map(|l| l.split_whitespace())
            .any(|flag| flag == "vmx" || flag == "svm"),
        Err(e) => {
            debug!(error = %e, "cannot read cpuinfo, assuming no kvm");
            false
        }
    }
}

/// First column of `-<what> help` output, header line dropped.
fn parse_help_list(stdout: &str, aliased_only: bool) -> Vec<String> {
    stdout
        .lines()
        .skip(1)
        .filter(|l| !aliased_only || l.contains("alias"))
        .filter_map(|l| l.split_whitespace().next())
        .map(str::to_string)
        .collect()
}

/// Accelerators compiled into the QEMU binary, e.g. `kvm`, `tcg`.
pub async fn qemu_accels(runner: &dyn CommandRunner, arch: &str) -> Result<Vec<String>> {
    let stdout = query_stdout(runner, HostCommand::new(qemu_binary(arch)).args(["-accel", "help"]))
        .await
        .context("listing qemu accelerators")?;
    Ok(parse_help_list(&stdout, false))
}

/// Machine types of the QEMU binary; with `aliased_only`, just the ones that
/// carry an alias (the versioned defaults such as `pc` or `q35`).
pub async fn qemu_machines(runner: &dyn CommandRunner, arch: &str, aliased_only: bool) -> Result<Vec<String>> {
    let stdout = query_stdout(runner, HostCommand::new(qemu_binary(arch)).args(["-machine", "help"]))
        .await
        .context("listing qemu machine types")?;
    Ok(parse_help_list(&stdout, aliased_only))
}

/// Picks a machine type: a preferred one if supported, else the first aliased one.
pub async fn preferred_machine(runner: &dyn CommandRunner, arch: &str) -> Result<Option<String>> {
    let machines = qemu_machines(runner, arch, false).await?;
    if let Some(m) = PREFERRED_MACHINES
        .iter()
        .find(|p| machines.iter().any(|m| m == *p))
    {
        return Ok(Some(m.to_string()));
    }

    let aliased = qemu_machines(runner, arch, true).await?;
    if let Some(m) = aliased.into_iter().next() {
        return Ok(Some(m));
    }

    warn!(arch = %arch, "cannot find available machine type, consider assign '--machine'");
    Ok(None)
}
