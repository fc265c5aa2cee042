//! IPv4 CIDR handling and guest address allocation.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use tracing::debug;

use crate::error::LaunchError;
use crate::exec::{sh, CommandRunner, HostCommand};

/// An IPv4 address with its prefix length, e.g. `192.168.1.5/24`.
///
/// The host bits are kept; use [`Ipv4Cidr::network`] for the masked form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Ipv4Cidr {
    addr: Ipv4Addr,
    prefix: u8,
}

impl Ipv4Cidr {
    pub fn new(addr: Ipv4Addr, prefix: u8) -> Result<Self> {
        if prefix > 32 {
            return Err(LaunchError::config(format!(
                "invalid prefix length /{} for {}",
                prefix, addr
            )));
        }
        Ok(Self { addr, prefix })
    }

    pub fn addr(&self) -> Ipv4Addr {
        self.addr
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    pub fn netmask(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.mask())
    }

    fn mask(&self) -> u32 {
        match self.prefix {
            0 => 0,
            p => u32::MAX << (32 - p as u32),
        }
    }

    /// Network address with host bits cleared.
    pub fn network(&self) -> Ipv4Cidr {
        Ipv4Cidr {
            addr: Ipv4Addr::from(u32::from(self.addr) & self.mask()),
            prefix: self.prefix,
        }
    }

    pub fn broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.addr) | !self.mask())
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        u32::from(ip) & self.mask() == u32::from(self.addr) & self.mask()
    }

    /// Usable host addresses, lowest first.
    ///
    /// Network and broadcast addresses are excluded, except for /31 (both
    /// addresses usable) and /32 (the single address).
    pub fn hosts(&self) -> impl DoubleEndedIterator<Item = Ipv4Addr> {
        let network = u32::from(self.network().addr);
        let broadcast = u32::from(self.broadcast());
        let (first, last) = match self.prefix {
            31 | 32 => (network, broadcast),
            _ => (network + 1, broadcast - 1),
        };
        (first..=last).map(Ipv4Addr::from)
    }

    /// Number of usable host addresses.
    pub fn host_count(&self) -> u64 {
        let size = 1u64 << (32 - self.prefix as u32);
        match self.prefix {
            31 | 32 => size,
            _ => size - 2,
        }
    }

    /// Same prefix, different address.
    pub fn with_addr(&self, addr: Ipv4Addr) -> Ipv4Cidr {
        Ipv4Cidr {
            addr,
            prefix: self.prefix,
        }
    }
}

impl fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

impl FromStr for Ipv4Cidr {
    type Err = anyhow::Error;

    /// Parses `a.b.c.d/p`; a bare address is taken as /32.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (addr_str, prefix_str) = match s.split_once('/') {
            Some((a, p)) => (a, Some(p)),
            None => (s, None),
        };

        let addr: Ipv4Addr = addr_str
            .parse()
            .map_err(|_| LaunchError::config(format!("invalid IPv4 address in {:?}", s)))?;
        let prefix = match prefix_str {
            Some(p) => p
                .parse::<u8>()
                .map_err(|_| LaunchError::config(format!("invalid prefix length in {:?}", s)))?,
            None => 32,
        };

        Self::new(addr, prefix)
    }
}

impl TryFrom<String> for Ipv4Cidr {
    type Error = anyhow::Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Ipv4Cidr> for String {
    fn from(c: Ipv4Cidr) -> Self {
        c.to_string()
    }
}

/// Address in the adjacent half-sized block: flips bit `32 - prefix` and
/// returns `prefix - 1`.
///
/// Deterministic and distinct from `ip`, but it may still collide with a live
/// host in the adjacent block.
pub fn gen_non_conflicting_ip(ip: Ipv4Addr, prefix: u8) -> Result<(Ipv4Addr, u8)> {
    if !(1..=32).contains(&prefix) {
        return Err(LaunchError::config(format!(
            "cannot derive a sibling address for {}/{}",
            ip, prefix
        )));
    }
    let flipped = u32::from(ip) ^ (1u32 << (32 - prefix as u32));
    Ok((Ipv4Addr::from(flipped), prefix - 1))
}

/// Liveness probe: one ping with a one second timeout.
pub async fn is_host_available(runner: &dyn CommandRunner, ip: Ipv4Addr) -> Result<bool> {
    let output = sh(
        runner,
        HostCommand::new("ping")
            .args(["-c", "1", "-W", "1"])
            .arg(ip.to_string())
            .query()
            .unchecked(),
    )
    .await?;
    Ok(output.success())
}

/// Finds an address in `network` that does not answer a liveness probe,
/// scanning from the highest host address down.
///
/// Best effort only: a host that drops ICMP looks free. Returns `None` when
/// every candidate answered.
pub async fn get_unused_ip(runner: &dyn CommandRunner, network: &Ipv4Cidr) -> Result<Option<Ipv4Addr>> {
    for ip in network.hosts().rev() {
        if is_host_available(runner, ip).await? {
            debug!(ip = %ip, "address in use");
            continue;
        }
        return Ok(Some(ip));
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::RecordingRunner;

    #[test]
    fn test_parse_and_display() {
        let c: Ipv4Cidr = "192.168.1.5/24".parse().unwrap();
        assert_eq!(c.addr(), Ipv4Addr::new(192, 168, 1, 5));
        assert_eq!(c.prefix(), 24);
        assert_eq!(c.to_string(), "192.168.1.5/24");
        assert_eq!(c.network().to_string(), "192.168.1.0/24");
        assert_eq!(c.netmask(), Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(c.broadcast(), Ipv4Addr::new(192, 168, 1, 255));

        let bare: Ipv4Cidr = "10.0.0.1".parse().unwrap();
        assert_eq!(bare.prefix(), 32);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for bad in ["", "192.168.1/24", "192.168.1.1/33", "fe80::1/64", "10.0.0.1/x"] {
            let err = bad.parse::<Ipv4Cidr>().unwrap_err();
            assert!(
                crate::error::classify(&err).is_some_and(|e| e.is_config()),
                "{:?} should be a config error",
                bad
            );
        }
    }

    #[test]
    fn test_contains() {
        let net: Ipv4Cidr = "192.168.1.0/24".parse().unwrap();
        assert!(net.contains(Ipv4Addr::new(192, 168, 1, 1)));
        assert!(!net.contains(Ipv4Addr::new(192, 168, 2, 1)));

        let any: Ipv4Cidr = "0.0.0.0/0".parse().unwrap();
        assert!(any.contains(Ipv4Addr::new(8, 8, 8, 8)));
    }

    #[test]
    fn test_hosts_edges() {
        let c24: Ipv4Cidr = "10.0.0.7/24".parse().unwrap();
        assert_eq!(c24.hosts().next(), Some(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(c24.hosts().next_back(), Some(Ipv4Addr::new(10, 0, 0, 254)));
        assert_eq!(c24.hosts().count() as u64, c24.host_count());

        let c31: Ipv4Cidr = "10.0.0.0/31".parse().unwrap();
        assert_eq!(c31.hosts().count(), 2);

        let c32: Ipv4Cidr = "10.0.0.9/32".parse().unwrap();
        assert_eq!(c32.hosts().collect::<Vec<_>>(), vec![Ipv4Addr::new(10, 0, 0, 9)]);
    }

    #[test]
    fn test_sibling_ip() {
        let ip = Ipv4Addr::new(192, 168, 1, 5);
        let (sib, prefix) = gen_non_conflicting_ip(ip, 24).unwrap();
        assert_eq!(sib, Ipv4Addr::new(192, 168, 0, 5));
        assert_eq!(prefix, 23);

        // Pure: same input, same output
        assert_eq!(gen_non_conflicting_ip(ip, 24).unwrap(), (sib, prefix));
    }

    #[test]
    fn test_sibling_ip_all_prefixes() {
        let ip = Ipv4Addr::new(172, 17, 0, 2);
        for prefix in 1..=32u8 {
            let (sib, new_prefix) = gen_non_conflicting_ip(ip, prefix).unwrap();
            assert_ne!(sib, ip, "prefix {}", prefix);
            assert_eq!(new_prefix, prefix - 1);
            // Both addresses share the enlarged block
            let block = Ipv4Cidr::new(ip, new_prefix).unwrap();
            assert!(block.contains(sib));
        }
        assert!(gen_non_conflicting_ip(ip, 0).is_err());
        assert!(gen_non_conflicting_ip(ip, 33).is_err());
    }

    #[tokio::test]
    async fn test_unused_ip_scans_from_top() {
        let runner = RecordingRunner::new()
            .fail("ping", 1, "")
            .respond("ping -c 1 -W 1 192.168.1.254", "")
            .respond("ping -c 1 -W 1 192.168.1.253", "");
        let net: Ipv4Cidr = "192.168.1.0/24".parse().unwrap();

        let ip = get_unused_ip(&runner, &net).await.unwrap();
        assert_eq!(ip, Some(Ipv4Addr::new(192, 168, 1, 252)));
        assert_eq!(runner.matching("ping").len(), 3);
    }

    #[tokio::test]
    async fn test_unused_ip_exhausted() {
        // Every probe answers
        let runner = RecordingRunner::new().respond("ping", "");
        let net: Ipv4Cidr = "10.1.1.0/29".parse().unwrap();

        let ip = get_unused_ip(&runner, &net).await.unwrap();
        assert_eq!(ip, None);
        assert_eq!(runner.matching("ping").len() as u64, net.host_count());
    }
}
