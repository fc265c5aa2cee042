use anyhow::{Context, Result};
use std::path::Path;
use tracing::{debug, info};
use uuid::Uuid;

use super::addr::{gen_non_conflicting_ip, get_unused_ip, Ipv4Cidr};
use super::host::list_interfaces;
use super::types::{generate_mac, NetworkMode};
use crate::error::LaunchError;
use crate::exec::{sh, CommandRunner, HostCommand};
use crate::qemu::opts::{QemuOpt, QemuOpts};

const VHOST_NET: &str = "/dev/vhost-net";
const TUN_DEV: &str = "/dev/net/tun";
const QEMU_CONF_DIR: &str = "/etc/qemu";

/// First fd handed to QEMU for slot 0; each slot uses `10 + 10 * index` and the next one.
const BASE_FD: usize = 10;

/// Picks a device name `<prefix><id>` not among live interfaces.
///
/// Returns the name and its 8-hex-char id. Nothing is created here.
pub async fn gen_netdev_name(runner: &dyn CommandRunner, mode: NetworkMode) -> Result<(String, String)> {
    let ifaces = list_interfaces(runner).await?;
    loop {
        let dev_id = Uuid::new_v4().simple().to_string()[..8].to_string();
        let dev_name = format!("{}{}", mode.device_prefix(), dev_id);
        if !ifaces.contains(&dev_name) {
            return Ok((dev_name, dev_id));
        }
        debug!(name = %dev_name, "device name taken, retrying");
    }
}

async fn ensure_vhost_net(runner: &dyn CommandRunner) -> Result<()> {
    if runner.exists(Path::new(VHOST_NET)).await {
        return Ok(());
    }
    sh(
        runner,
        HostCommand::new("mknod").args(["-m", "660", VHOST_NET, "c", "10", "238"]),
    )
    .await
    .context("creating /dev/vhost-net")?;
    Ok(())
}

async fn ip(runner: &dyn CommandRunner, args: &[&str]) -> Result<()> {
    sh(runner, HostCommand::new("ip").args(args.iter().copied())).await?;
    Ok(())
}

/// Enslaves `iface` to a new bridge and attaches a fresh tap device to it.
///
/// With an address plan, the interface's address moves onto the bridge.
/// Returns the tap device name.
pub async fn setup_tap_bridge(
    runner: &dyn CommandRunner,
    iface: &str,
    dev_name: &str,
    dev_id: &str,
    mac: &str,
    ipnet: Option<&Ipv4Cidr>,
) -> Result<String> {
    ip(runner, &["link", "add", "dev", dev_name, "type", "bridge"]).await?;
    ip(runner, &["link", "set", iface, "master", dev_name]).await?;

    // qemu-bridge-helper refuses bridges not listed here
    sh(runner, HostCommand::new("mkdir").args(["-p", QEMU_CONF_DIR])).await?;
    sh(
        runner,
        HostCommand::shell(format!("echo allow {} > {}/bridge.conf", dev_name, QEMU_CONF_DIR)),
    )
    .await
    .context("writing bridge.conf")?;

    // No udev inside the container
    if !runner.exists(Path::new(TUN_DEV)).await {
        sh(runner, HostCommand::new("mkdir").args(["-p", "-m", "755", "/dev/net"])).await?;
        sh(
            runner,
            HostCommand::new("mknod").args(["-m", "666", TUN_DEV, "c", "10", "200"]),
        )
        .await
        .context("creating /dev/net/tun")?;
    }

    let tap_name = format!("tap{}", dev_id);
    ip(runner, &["tuntap", "add", "dev", &tap_name, "mode", "tap"]).await?;
    ip(runner, &["link", "set", &tap_name, "address", mac]).await?;
    ip(runner, &["link", "set", &tap_name, "up"]).await?;
    ip(runner, &["link", "set", &tap_name, "master", dev_name]).await?;
    ip(runner, &["link", "set", dev_name, "up"]).await?;

    if let Some(ipnet) = ipnet {
        let cidr = ipnet.to_string();
        ip(runner, &["address", "flush", "dev", iface]).await?;
        ip(runner, &["address", "add", &cidr, "brd", "+", "dev", dev_name]).await?;
        info!(bridge = %dev_name, addr = %cidr, "moved interface address to bridge");
    }

    info!(iface = %iface, bridge = %dev_name, tap = %tap_name, "tap bridge ready");
    Ok(tap_name)
}

/// Parses the `major:minor` pair of a character device.
fn parse_dev_numbers(s: &str) -> Result<(u32, u32)> {
    s.trim()
        .split_once(':')
        .and_then(|(major, minor)| Some((major.parse().ok()?, minor.parse().ok()?)))
        .ok_or_else(|| LaunchError::environment(format!("unparsable device number {:?}", s.trim())))
}

/// Creates a macvtap device for the guest and a macvlan device for the host
/// on top of `iface`.
///
/// With an address plan, the host device takes the sibling address so the
/// container can still reach the guest's network. Returns the macvtap name.
pub async fn setup_macvlan_bridge(
    runner: &dyn CommandRunner,
    iface: &str,
    dev_name: &str,
    dev_id: &str,
    mac: &str,
    ipnet: Option<&Ipv4Cidr>,
) -> Result<String> {
    let vtap = format!("macvtap{}", dev_id);
    ip(
        runner,
        &["link", "add", "link", iface, "name", &vtap, "type", "macvtap", "mode", "bridge"],
    )
    .await?;
    ip(runner, &["link", "set", &vtap, "address", mac]).await?;
    ip(runner, &["link", "set", &vtap, "up"]).await?;

    ip(
        runner,
        &["link", "add", "link", iface, "name", dev_name, "type", "macvlan", "mode", "bridge"],
    )
    .await?;

    // No udev inside the container: create the tap char device ourselves
    let out = sh(
        runner,
        HostCommand::shell(format!("cat /sys/devices/virtual/net/{}/tap*/dev", vtap))
            .simulated_stdout("0:0"),
    )
    .await
    .with_context(|| format!("reading device number of {}", vtap))?;
    let (major, minor) = parse_dev_numbers(&out.stdout)?;
    sh(
        runner,
        HostCommand::new("mknod").args([
            format!("/dev/{}", vtap),
            "c".to_string(),
            major.to_string(),
            minor.to_string(),
        ]),
    )
    .await
    .with_context(|| format!("creating /dev/{}", vtap))?;

    ip(runner, &["link", "set", dev_name, "up"]).await?;

    if let Some(ipnet) = ipnet {
        let (sibling, prefix) = gen_non_conflicting_ip(ipnet.addr(), ipnet.prefix())?;
        let cidr = Ipv4Cidr::new(sibling, prefix)?.to_string();
        ip(runner, &["address", "add", &cidr, "dev", dev_name]).await?;
        info!(dev = %dev_name, addr = %cidr, "assigned sibling address to macvlan device");
    }

    info!(iface = %iface, macvlan = %dev_name, macvtap = %vtap, "macvlan bridge ready");
    Ok(vtap)
}

/// Builds the host side of NIC slot `index` for `iface` and registers the
/// matching netdev/device options.
///
/// Returns the guest MAC and, when the interface has an address plan, the
/// address picked for the guest with the plan's prefix.
pub async fn setup_bridge(
    runner: &dyn CommandRunner,
    qemu: &mut QemuOpts,
    iface: &str,
    mode: NetworkMode,
    ipnet: Option<&Ipv4Cidr>,
    index: usize,
) -> Result<(String, Option<Ipv4Cidr>)> {
    let (dev_name, dev_id) = gen_netdev_name(runner, mode).await?;
    let fd = BASE_FD + index * 10;
    let vhost_fd = fd + 1;
    let nic_id = format!("nic{}", index);
    let mac = generate_mac();

    info!(iface = %iface, mode = %mode, nic = %nic_id, mac = %mac, "setting up bridge");

    ensure_vhost_net(runner).await?;

    match mode {
        NetworkMode::TapBridge => {
            let tap = setup_tap_bridge(runner, iface, &dev_name, &dev_id, &mac, ipnet).await?;
            qemu.append(QemuOpt::group(
                "netdev",
                "tap",
                [
                    ("id", nic_id.as_str()),
                    ("ifname", tap.as_str()),
                    ("script", "no"),
                    ("downscript", "no"),
                ],
            ));
        }
        NetworkMode::Macvlan => {
            let vtap = setup_macvlan_bridge(runner, iface, &dev_name, &dev_id, &mac, ipnet).await?;
            qemu.append(QemuOpt::group(
                "netdev",
                "tap",
                [
                    ("id", nic_id.clone()),
                    ("fd", fd.to_string()),
                    ("vhost", "on".to_string()),
                    ("vhostfd", vhost_fd.to_string()),
                ],
            ));
            qemu.append_ext_arg(format!("{}<>/dev/{}", fd, vtap));
            qemu.append_ext_arg(format!("{}<>{}", vhost_fd, VHOST_NET));
        }
    }

    qemu.append(QemuOpt::group(
        "device",
        "virtio-net-pci",
        [("netdev", nic_id.as_str()), ("mac", mac.as_str())],
    ));

    let guest_cidr = match ipnet {
        Some(ipnet) => {
            let network = ipnet.network();
            info!(network = %network, "finding available ip");
            let ip = get_unused_ip(runner, &network)
                .await?
                .ok_or_else(|| LaunchError::environment(format!("no available ip in '{}'", ipnet)))?;
            Some(ipnet.with_addr(ip))
        }
        None => None,
    };

    Ok((mac, guest_cidr))
}
