use anyhow::{Context, Result};
use std::net::Ipv4Addr;
use tracing::{info, warn};

use super::addr::Ipv4Cidr;
use super::bridged::setup_bridge;
use super::host::{default_gateway, default_interface, interface_info, list_bridges, list_interfaces};
use super::types::{BridgeResult, InterfacePlan};
use crate::config::RuntimeConfig;
use crate::error::LaunchError;
use crate::exec::{sh, CommandRunner, HostCommand};

/// Interfaces handed to the guest: the explicit selection, validated against
/// live non-bridge interfaces, or else the default-route interface.
pub async fn get_vm_interfaces(runner: &dyn CommandRunner, selected: &[String]) -> Result<Vec<String>> {
    if selected.is_empty() {
        return Ok(vec![default_interface(runner).await?]);
    }

    let bridges = list_bridges(runner).await?;
    let live: Vec<String> = list_interfaces(runner)
        .await?
        .into_iter()
        .filter(|i| !bridges.contains(i))
        .collect();

    let mut ifaces: Vec<String> = Vec::with_capacity(selected.len());
    for iface in selected {
        if !live.contains(iface) {
            return Err(LaunchError::config(format!(
                "iface '{}' not found in {:?}",
                iface, live
            )));
        }
        if ifaces.contains(iface) {
            warn!(iface = %iface, "interface selected twice, ignoring duplicate");
            continue;
        }
        ifaces.push(iface.clone());
    }
    Ok(ifaces)
}

/// Addresses of `iface` eligible for the guest network.
///
/// With `filters`, only addresses inside one of them are kept. Without,
/// an interface carrying more than one address is ambiguous.
pub async fn get_interface_ipnets(
    runner: &dyn CommandRunner,
    iface: &str,
    filters: &[Ipv4Cidr],
) -> Result<Vec<Ipv4Cidr>> {
    let info = interface_info(runner, iface).await?;

    if filters.is_empty() {
        if info.addrs.len() > 1 {
            let addrs: Vec<String> = info.addrs.iter().map(ToString::to_string).collect();
            return Err(LaunchError::config(format!(
                "multiple ipnets found in {}: [{}], consider assign '--network' parameter",
                iface,
                addrs.join(", ")
            )));
        }
        return Ok(info.addrs);
    }

    Ok(info
        .addrs
        .into_iter()
        .filter(|a| filters.iter().any(|n| n.contains(a.addr())))
        .collect())
}

/// Reads everything needed to provision the VM network without changing the host.
pub async fn plan_interfaces(runner: &dyn CommandRunner, config: &RuntimeConfig) -> Result<InterfacePlan> {
    let ifaces = get_vm_interfaces(runner, &config.ifaces).await?;
    let mut entries = Vec::with_capacity(ifaces.len());
    for iface in ifaces {
        let nets = get_interface_ipnets(runner, &iface, &config.networks).await?;
        if nets.is_empty() {
            info!(iface = %iface, "no ip/net found");
        } else if nets.len() > 1 {
            warn!(iface = %iface, using = %nets[0], candidates = nets.len(), "several ip/nets match --network");
        }
        entries.push((iface, nets.first().copied()));
    }
    Ok(InterfacePlan::new(entries))
}

/// Provisions one bridge per selected interface and restores the default route.
///
/// All interfaces are planned (and validated) before the first host mutation.
pub async fn configure_network(
    runner: &dyn CommandRunner,
    config: &mut RuntimeConfig,
) -> Result<(Ipv4Addr, BridgeResult)> {
    let gw = default_gateway(runner).await?;
    let plan = plan_interfaces(runner, config).await?;
    info!(gateway = %gw, interfaces = plan.len(), mode = %config.network_mode, "configuring network");

    let mut result = BridgeResult::default();
    for (index, (iface, ipnet)) in plan.iter().enumerate() {
        let (mac, guest_cidr) = setup_bridge(
            runner,
            &mut config.qemu,
            iface,
            config.network_mode,
            ipnet,
            index,
        )
        .await
        .with_context(|| format!("setting up bridge for {}", iface))?;
        result.push(iface, mac, guest_cidr);
    }

    // Enslaving the interface drops its routes
    let out = sh(
        runner,
        HostCommand::new("ip")
            .args(["route", "add", "default", "via"])
            .arg(gw.to_string())
            .unchecked(),
    )
    .await?;
    if !out.success() {
        warn!(gateway = %gw, stderr = %out.stderr.trim(), "resetting default route failed");
    }

    Ok((gw, result))
}
