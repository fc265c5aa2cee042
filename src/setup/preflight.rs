use anyhow::Result;
use tracing::{debug, info};

use crate::error::LaunchError;
use crate::exec::{sh, CommandRunner, HostCommand};

const PROBE_DEVICE: &str = "/dev/tmp-vhost-net";

/// Linux capabilities relevant to the launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostCapabilities {
    pub net_admin: bool,
}

impl HostCapabilities {
    /// Reads the effective capability set of this process.
    #[cfg(target_os = "linux")]
    pub fn probe() -> Self {
        let net_admin = caps::has_cap(
            None,
            caps::CapSet::Effective,
            caps::Capability::CAP_NET_ADMIN,
        )
        .unwrap_or_else(|e| {
            debug!(error = %e, "reading capabilities failed");
            false
        });
        Self { net_admin }
    }

    #[cfg(not(target_os = "linux"))]
    pub fn probe() -> Self {
        Self { net_admin: false }
    }
}

/// Checks that a device node can be created and written to, which the device
/// cgroup of an unprivileged container forbids.
async fn check_device_access(runner: &dyn CommandRunner) -> Result<()> {
    sh(
        runner,
        HostCommand::new("mknod").args(["-m", "660", PROBE_DEVICE, "c", "10", "238"]),
    )
    .await?;

    let out = sh(
        runner,
        HostCommand::shell(format!("echo 1 >{}", PROBE_DEVICE)).unchecked(),
    )
    .await?;
    if out.stderr.contains("Operation not permitted") {
        return Err(LaunchError::permission(
            "device permissions are required for macvlan network, consider run container \
             with \"--device-cgroup-rule='c *:* rwm'\" or \"--privileged\"",
        ));
    }
    Ok(())
}

/// Fails fast when the container lacks what network setup needs.
///
/// Runs before any other host mutation. The probe device is removed whether
/// or not the check succeeds.
pub async fn check_capabilities(
    runner: &dyn CommandRunner,
    caps: HostCapabilities,
    macvlan: bool,
) -> Result<()> {
    if !caps.net_admin {
        return Err(LaunchError::permission(
            "'CAP_NET_ADMIN' is required, please run container with \
             '--cap-add=NET_ADMIN' or '--privileged'",
        ));
    }

    let result = if macvlan {
        check_device_access(runner).await
    } else {
        Ok(())
    };

    let cleanup = sh(runner, HostCommand::new("rm").args(["-f", PROBE_DEVICE])).await;
    result?;
    cleanup?;

    info!(macvlan, "capability preflight passed");
    Ok(())
}
