use anyhow::{Context, Result};
use std::net::Ipv4Addr;
use tracing::{info, warn};

use super::addr::Ipv4Cidr;
use super::host::nameservers;
use super::types::BridgeResult;
use crate::error::LaunchError;
use crate::exec::{sh, CommandRunner, HostCommand};

const DNSMASQ_LOG: &str = "/var/log/dnsmasq.log";

/// The guest network reachable through the default gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefaultNetwork {
    pub iface: String,
    pub mac: String,
    /// Guest address with the interface's prefix.
    pub guest: Ipv4Cidr,
}

/// Finds the interface whose guest address shares a network with `gw`.
///
/// Interfaces without a guest address are skipped. When several match, the
/// last one in enumeration order wins.
pub fn select_default_network(gw: Ipv4Addr, result: &BridgeResult) -> Result<DefaultNetwork> {
    result
        .interfaces
        .iter()
        .filter_map(|r| r.guest_cidr.map(|c| (r, c)))
        .filter(|(_, cidr)| cidr.contains(gw))
        .last()
        .map(|(r, cidr)| DefaultNetwork {
            iface: r.iface.clone(),
            mac: r.mac.clone(),
            guest: cidr,
        })
        .ok_or_else(|| LaunchError::environment(format!("cannot find network for {}", gw)))
}

/// Arguments for a dnsmasq instance that hands out exactly one lease.
///
/// The dns-server option is left out when there are no servers to offer.
pub fn dnsmasq_args(gw: Ipv4Addr, net: &DefaultNetwork, dns: &[Ipv4Addr]) -> Vec<String> {
    let ip = net.guest.addr();
    let mut args = vec![
        "--log-queries".to_string(),
        format!("--log-facility={}", DNSMASQ_LOG),
        format!("--dhcp-range={},{}", ip, ip),
        format!("--dhcp-host={},{},infinite", net.mac, ip),
        format!("--dhcp-option=option:netmask,{}", net.guest.netmask()),
    ];
    if !dns.is_empty() {
        let servers: Vec<String> = dns.iter().map(Ipv4Addr::to_string).collect();
        args.push(format!("--dhcp-option=option:dns-server,{}", servers.join(",")));
    }
    args.push(format!("--dhcp-option=option:router,{}", gw));
    args
}

/// Starts dnsmasq to lease the default network's guest address to the VM.
pub async fn configure_dhcp(runner: &dyn CommandRunner, gw: Ipv4Addr, result: &BridgeResult) -> Result<()> {
    let net = select_default_network(gw, result)?;
    let dns = nameservers(runner).await?;
    if dns.is_empty() {
        warn!("no IPv4 nameserver on the host, guest gets no DNS server by DHCP");
    }
    let args = dnsmasq_args(gw, &net, &dns);

    info!(
        iface = %net.iface,
        guest_ip = %net.guest.addr(),
        mac = %net.mac,
        "starting dnsmasq"
    );
    sh(runner, HostCommand::new("dnsmasq").args(args))
        .await
        .context("starting dnsmasq")?;
    Ok(())
}
