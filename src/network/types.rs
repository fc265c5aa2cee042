use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;

use super::addr::Ipv4Cidr;
use crate::error::LaunchError;

/// How a host interface is exposed to the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    /// Bridge + tap device; the host address moves onto the bridge.
    TapBridge,
    /// macvtap for the guest, sibling macvlan for the host side.
    Macvlan,
}

impl NetworkMode {
    /// Prefix of generated host device names.
    pub fn device_prefix(&self) -> &'static str {
        match self {
            NetworkMode::TapBridge => "tapbr",
            NetworkMode::Macvlan => "macvlan",
        }
    }
}

impl fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.device_prefix())
    }
}

/// Interfaces taking part in the VM network, in enumeration order, each with
/// the address plan (if any) picked for it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfacePlan {
    entries: Vec<(String, Option<Ipv4Cidr>)>,
}

impl InterfacePlan {
    pub fn new(entries: Vec<(String, Option<Ipv4Cidr>)>) -> Self {
        Self { entries }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&Ipv4Cidr>)> {
        self.entries.iter().map(|(i, c)| (i.as_str(), c.as_ref()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Outcome of bridging one interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceResult {
    pub iface: String,
    pub mac: String,
    /// Address the guest will be handed over DHCP, with the interface's prefix.
    pub guest_cidr: Option<Ipv4Cidr>,
}

/// Per-interface results of network setup, in enumeration order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeResult {
    pub interfaces: Vec<InterfaceResult>,
}

impl BridgeResult {
    pub fn push(&mut self, iface: impl Into<String>, mac: impl Into<String>, guest_cidr: Option<Ipv4Cidr>) {
        self.interfaces.push(InterfaceResult {
            iface: iface.into(),
            mac: mac.into(),
            guest_cidr,
        });
    }

    pub fn get(&self, iface: &str) -> Option<&InterfaceResult> {
        self.interfaces.iter().find(|r| r.iface == iface)
    }

    pub fn is_empty(&self) -> bool {
        self.interfaces.is_empty()
    }
}

/// Port forward from the container to the guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMapping {
    /// Port the guest listens on.
    pub guest_port: u16,
    /// Port exposed on the container.
    pub host_port: u16,
    pub proto: Protocol,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

impl PortMapping {
    /// Parse port forward spec: INTERNAL:EXTERNAL[/PROTO]
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        let (ports, proto) = match s.split_once('/') {
            Some((ports, "tcp")) => (ports, Protocol::Tcp),
            Some((ports, "udp")) => (ports, Protocol::Udp),
            Some((_, other)) => {
                return Err(LaunchError::config(format!(
                    "invalid protocol {:?} in port forward spec: {}",
                    other, s
                )))
            }
            None => (s, Protocol::Tcp),
        };

        let (guest_port_str, host_port_str) = ports.split_once(':').ok_or_else(|| {
            LaunchError::config(format!("invalid port forward spec: {}", s))
        })?;

        let guest_port = guest_port_str.trim().parse().map_err(|_| {
            LaunchError::config(format!("invalid internal port {:?} in: {}", guest_port_str, s))
        })?;
        let host_port = host_port_str.trim().parse().map_err(|_| {
            LaunchError::config(format!("invalid external port {:?} in: {}", host_port_str, s))
        })?;

        Ok(Self {
            guest_port,
            host_port,
            proto,
        })
    }
}

impl fmt::Display for PortMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.guest_port, self.host_port, self.proto)
    }
}

/// Forwards installed when none are declared: SSH and RDP.
pub const DEFAULT_PORT_FORWARDS: &[&str] = &["22:22", "3389:3389"];

/// Host view of one interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceInfo {
    pub addrs: Vec<Ipv4Cidr>,
    pub mac: String,
}

/// Default route of the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefaultRoute {
    pub gateway: Ipv4Addr,
    pub iface: String,
}

/// Generate a random MAC address for the guest
pub fn generate_mac() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();

    // Use locally administered unicast MAC (first byte is 0x02)
    format!(
        "02:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
        rng.gen::<u8>(),
        rng.gen::<u8>(),
        rng.gen::<u8>(),
        rng.gen::<u8>(),
        rng.gen::<u8>()
    )
}
