// Common test utilities for cvm integration tests
#![allow(dead_code)]

use clap::Parser;
use cvm::cli::{Cli, Commands, RunArgs};
use cvm::exec::RecordingRunner;
use cvm::RuntimeConfig;

pub const DEFAULT_ROUTE: &str = "default via 172.17.0.1 dev eth0 \n";

pub const LINKS: &str = "\
1: lo: <LOOPBACK,UP,LOWER_UP> mtu 65536 qdisc noqueue state UNKNOWN mode DEFAULT group default qlen 1000\\    link/loopback 00:00:00:00:00:00 brd 00:00:00:00:00:00
2: tunl0@NONE: <NOARP> mtu 1480 qdisc noop state DOWN mode DEFAULT group default qlen 1000\\    link/ipip 0.0.0.0 brd 0.0.0.0
3: eth0@if12: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500 qdisc noqueue state UP mode DEFAULT group default \\    link/ether 02:42:ac:11:00:02 brd ff:ff:ff:ff:ff:ff link-netnsid 0
4: eth1@if14: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500 qdisc noqueue state UP mode DEFAULT group default \\    link/ether 02:42:0a:00:00:02 brd ff:ff:ff:ff:ff:ff link-netnsid 0
";

pub const ADDR_ETH0: &str = "\
3: eth0@if12: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500 qdisc noqueue state UP group default
    link/ether 02:42:ac:11:00:02 brd ff:ff:ff:ff:ff:ff link-netnsid 0
    inet 172.17.0.2/16 brd 172.17.255.255 scope global eth0
       valid_lft forever preferred_lft forever
";

pub const ADDR_ETH1: &str = "\
4: eth1@if14: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500 qdisc noqueue state UP group default
    link/ether 02:42:0a:00:00:02 brd ff:ff:ff:ff:ff:ff link-netnsid 0
    inet 10.0.0.2/24 brd 10.0.0.255 scope global eth1
       valid_lft forever preferred_lft forever
";

pub const MACHINES: &str = "\
Supported machines are:
pc                   Standard PC (i440FX + PIIX, 1996) (alias of pc-i440fx-8.2)
q35                  Standard PC (Q35 + ICH9, 2009) (alias of pc-q35-8.2)
";

/// A container with eth0 (default route, 172.17.0.2/16) and eth1 (10.0.0.2/24),
/// KVM available, and no other host on either network.
pub fn container_host() -> RecordingRunner {
    RecordingRunner::new()
        .respond("ip route show default", DEFAULT_ROUTE)
        .respond("ip -o link show", LINKS)
        .respond("ip -o link show type bridge", "")
        .respond("ip address show dev eth0", ADDR_ETH0)
        .respond("ip address show dev eth1", ADDR_ETH1)
        .respond("qemu-system-x86_64 -machine help", MACHINES)
        .respond("sh -c cat /sys/devices/virtual/net", "240:1\n")
        .fail("ping", 1, "")
        .with_file("/proc/cpuinfo", "flags\t\t: fpu vme vmx lm\n")
        .with_file("/etc/resolv.conf", "nameserver 8.8.8.8\n")
        .with_file("/dev/vhost-net", "")
        .with_file("/dev/net/tun", "")
}

pub fn parse_run(argv: &[&str]) -> RunArgs {
    let mut full = vec!["cvm", "run"];
    full.extend_from_slice(argv);
    match Cli::try_parse_from(&full) {
        Ok(cli) => match cli.cmd {
            Commands::Run(args) => args,
        },
        Err(e) => panic!("failed to parse {:?}: {}", full, e),
    }
}

/// Runtime config from `cvm run <argv>` with storage under /storage.
pub fn config(argv: &[&str]) -> RuntimeConfig {
    let mut full = vec!["--storage-dir", "/storage"];
    full.extend_from_slice(argv);
    RuntimeConfig::from_args(parse_run(&full)).unwrap()
}
