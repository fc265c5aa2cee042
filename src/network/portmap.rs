use anyhow::{Context, Result};
use std::net::Ipv4Addr;
use tracing::{debug, info};

use super::dhcp::select_default_network;
use super::types::{BridgeResult, PortMapping, DEFAULT_PORT_FORWARDS};
use crate::exec::{sh, CommandRunner, HostCommand};

/// DNAT rule sending `host_port` on the container to the guest.
fn dnat_rule(guest_ip: Ipv4Addr, mapping: &PortMapping) -> HostCommand {
    HostCommand::new("iptables").args([
        "-t".to_string(),
        "nat".to_string(),
        "-A".to_string(),
        "PREROUTING".to_string(),
        "-p".to_string(),
        mapping.proto.to_string(),
        "--dport".to_string(),
        mapping.host_port.to_string(),
        "-j".to_string(),
        "DNAT".to_string(),
        "--to-destination".to_string(),
        format!("{}:{}", guest_ip, mapping.guest_port),
    ])
}

/// MASQUERADE rule so replies from the guest return through the container.
fn masquerade_rule(guest_ip: Ipv4Addr, mapping: &PortMapping) -> HostCommand {
    HostCommand::new("iptables").args([
        "-t".to_string(),
        "nat".to_string(),
        "-A".to_string(),
        "POSTROUTING".to_string(),
        "-p".to_string(),
        mapping.proto.to_string(),
        "-d".to_string(),
        guest_ip.to_string(),
        "--dport".to_string(),
        mapping.guest_port.to_string(),
        "-j".to_string(),
        "MASQUERADE".to_string(),
    ])
}

/// Parses every spec up front so a bad one installs nothing.
pub fn parse_port_forwards(specs: Option<&[String]>) -> Result<Vec<PortMapping>> {
    match specs {
        Some(specs) => specs
            .iter()
            .map(|s| PortMapping::parse(s))
            .collect::<Result<Vec<_>>>()
            .context("parsing port forwards"),
        None => DEFAULT_PORT_FORWARDS
            .iter()
            .map(|s| PortMapping::parse(s))
            .collect(),
    }
}

/// Installs NAT rules forwarding container ports to the guest on the
/// default network.
///
/// `specs` of `None` means nothing was declared and the SSH/RDP defaults
/// apply; an empty list installs nothing.
pub async fn configure_port_forward(
    runner: &dyn CommandRunner,
    specs: Option<&[String]>,
    gw: Ipv4Addr,
    result: &BridgeResult,
) -> Result<Vec<PortMapping>> {
    let guest_ip = select_default_network(gw, result)?.guest.addr();
    let mappings = parse_port_forwards(specs)?;

    debug!(guest_ip = %guest_ip, mappings = mappings.len(), "setting up port forwards");

    for mapping in &mappings {
        sh(runner, dnat_rule(guest_ip, mapping))
            .await
            .with_context(|| format!("adding DNAT rule for port {}", mapping.host_port))?;
        sh(runner, masquerade_rule(guest_ip, mapping))
            .await
            .with_context(|| format!("adding MASQUERADE rule for port {}", mapping.guest_port))?;

        info!(
            host_port = mapping.host_port,
            guest_port = mapping.guest_port,
            proto = %mapping.proto,
            "port forward installed"
        );
    }

    Ok(mappings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_undeclared() {
        let mappings = parse_port_forwards(None).unwrap();
        assert_eq!(
            mappings.iter().map(ToString::to_string).collect::<Vec<_>>(),
            vec!["22:22/tcp".to_string(), "3389:3389/tcp".to_string()]
        );

        let none_declared: Vec<String> = Vec::new();
        assert!(parse_port_forwards(Some(none_declared.as_slice()))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_rule_shape() {
        let mapping = PortMapping::parse("53:5353/udp").unwrap();
        let ip = Ipv4Addr::new(10, 0, 0, 5);
        assert_eq!(
            dnat_rule(ip, &mapping).to_string(),
            "iptables -t nat -A PREROUTING -p udp --dport 5353 -j DNAT --to-destination 10.0.0.5:53"
        );
        assert_eq!(
            masquerade_rule(ip, &mapping).to_string(),
            "iptables -t nat -A POSTROUTING -p udp -d 10.0.0.5 --dport 53 -j MASQUERADE"
        );
    }
}
