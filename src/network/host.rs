//! Read-only queries against the host network stack.

use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::path::Path;
use tracing::debug;

use super::addr::Ipv4Cidr;
use super::types::{DefaultRoute, InterfaceInfo};
use crate::error::LaunchError;
use crate::exec::{query_stdout, CommandRunner, HostCommand};

const RESOLV_CONF: &str = "/etc/resolv.conf";
const SYSTEMD_RESOLV_CONF: &str = "/run/systemd/resolve/resolv.conf";

/// Token following `key` in whitespace-separated output.
fn field_after<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    let mut words = line.split_whitespace();
    words.by_ref().find(|w| *w == key)?;
    words.next()
}

/// Parses `ip route show default` output.
pub fn parse_default_route(stdout: &str) -> Result<DefaultRoute> {
    // Output format: "default via 192.168.1.1 dev eth0 ..."
    let line = stdout
        .lines()
        .find(|l| l.trim_start().starts_with("default"))
        .ok_or_else(|| LaunchError::environment("no default route"))?;

    let gateway = field_after(line, "via")
        .ok_or_else(|| LaunchError::environment(format!("default route has no gateway: {}", line)))?;
    let gateway: Ipv4Addr = gateway.parse().map_err(|_| {
        LaunchError::environment(format!("unparsable default gateway {:?}", gateway))
    })?;
    let iface = field_after(line, "dev")
        .ok_or_else(|| LaunchError::environment(format!("default route has no device: {}", line)))?;

    Ok(DefaultRoute {
        gateway,
        iface: iface.to_string(),
    })
}

pub async fn default_route(runner: &dyn CommandRunner) -> Result<DefaultRoute> {
    let stdout = query_stdout(runner, HostCommand::new("ip").args(["route", "show", "default"]))
        .await
        .context("reading default route")?;
    parse_default_route(&stdout)
}

pub async fn default_gateway(runner: &dyn CommandRunner) -> Result<Ipv4Addr> {
    Ok(default_route(runner).await?.gateway)
}

/// Detects the default network interface for outbound traffic
pub async fn default_interface(runner: &dyn CommandRunner) -> Result<String> {
    Ok(default_route(runner).await?.iface)
}

/// Parses `ip -o link show`: one device per line, `N: name[@peer]: <FLAGS> ...`.
///
/// Loopback devices and devices with a `noop` qdisc (never brought up, e.g.
/// `tunl0`) are skipped.
pub fn parse_link_names(stdout: &str) -> BTreeSet<String> {
    stdout
        .lines()
        .filter(|l| !l.contains("LOOPBACK") && !l.contains(" noop "))
        .filter_map(|l| l.split(':').nth(1))
        .map(|name| name.trim())
        .map(|name| name.split('@').next().unwrap_or(name).to_string())
        .filter(|name| !name.is_empty())
        .collect()
}

/// Live interfaces, bridges included.
pub async fn list_interfaces(runner: &dyn CommandRunner) -> Result<BTreeSet<String>> {
    let stdout = query_stdout(runner, HostCommand::new("ip").args(["-o", "link", "show"]))
        .await
        .context("listing interfaces")?;
    Ok(parse_link_names(&stdout))
}

pub async fn list_bridges(runner: &dyn CommandRunner) -> Result<BTreeSet<String>> {
    let stdout = query_stdout(
        runner,
        HostCommand::new("ip").args(["-o", "link", "show", "type", "bridge"]),
    )
    .await
    .context("listing bridges")?;
    Ok(parse_link_names(&stdout))
}

/// Parses `ip address show dev <iface>`.
pub fn parse_interface_info(iface: &str, stdout: &str) -> Result<InterfaceInfo> {
    let mut addrs = Vec::new();
    let mut mac = None;

    for line in stdout.lines() {
        let line = line.trim();
        if line.starts_with("inet ") {
            if let Some(cidr) = field_after(line, "inet") {
                addrs.push(cidr.parse::<Ipv4Cidr>().with_context(|| {
                    format!("parsing address of {}", iface)
                })?);
            }
        } else if line.starts_with("link/ether") && mac.is_none() {
            mac = field_after(line, "link/ether").map(str::to_string);
        }
    }

    let mac = mac.ok_or_else(|| {
        LaunchError::environment(format!("cannot find mac for {}, output: {}", iface, stdout))
    })?;

    Ok(InterfaceInfo { addrs, mac })
}

pub async fn interface_info(runner: &dyn CommandRunner, iface: &str) -> Result<InterfaceInfo> {
    let stdout = query_stdout(
        runner,
        HostCommand::new("ip").args(["address", "show", "dev", iface]),
    )
    .await
    .with_context(|| format!("reading addresses of {}", iface))?;
    parse_interface_info(iface, &stdout)
}

/// IPv4 `nameserver` entries; other address families are skipped.
fn parse_nameservers(resolv: &str) -> Vec<Ipv4Addr> {
    resolv
        .lines()
        .filter_map(|line| line.trim().strip_prefix("nameserver "))
        .map(str::trim)
        .filter_map(|s| match s.parse::<Ipv4Addr>() {
            Ok(ip) => Some(ip),
            Err(_) => {
                debug!(server = s, "skipping non-IPv4 nameserver");
                None
            }
        })
        .collect()
}

/// Read IPv4 DNS servers from the host's resolver configuration
///
/// If only localhost addresses are listed (systemd-resolved stub), the real
/// upstream servers are read from /run/systemd/resolve/resolv.conf.
pub async fn nameservers(runner: &dyn CommandRunner) -> Result<Vec<Ipv4Addr>> {
    let resolv = runner
        .read_to_string(Path::new(RESOLV_CONF))
        .await
        .context("reading nameservers")?;
    let servers = parse_nameservers(&resolv);

    if servers.iter().all(|s| s.is_loopback()) {
        if let Ok(real) = runner.read_to_string(Path::new(SYSTEMD_RESOLV_CONF)).await {
            let real_servers: Vec<Ipv4Addr> = parse_nameservers(&real)
                .into_iter()
                .filter(|s| !s.is_loopback())
                .collect();
            if !real_servers.is_empty() {
                debug!(servers = ?real_servers, "using systemd-resolved upstream servers");
                return Ok(real_servers);
            }
        }
    }

    Ok(servers)
}
