//! End-to-end launch sequencing against a scripted container host.

mod common;

use cvm::commands::{LaunchPlan, LaunchStage, Launcher};
use cvm::error::classify;
use cvm::exec::DryRunRunner;
use cvm::setup::HostCapabilities;

const CAPS: HostCapabilities = HostCapabilities { net_admin: true };

/// Words the shell would hand to QEMU.
fn argv(command: &str) -> Vec<String> {
    shell_words::split(command).unwrap()
}

fn has_opt(argv: &[String], key: &str, value: &str) -> bool {
    argv.windows(2).any(|w| w[0] == key && w[1] == value)
}

#[tokio::test]
async fn test_full_launch_sequence() {
    let runner = common::container_host();
    let config = common::config(&["--cpu", "2", "--mem", "2048", "--", "-usb"]);
    let mut launcher = Launcher::new(&runner, config, CAPS);

    let outcome = launcher.run().await.unwrap();
    assert_eq!(outcome.exit_code, 0);
    assert_eq!(launcher.stage(), LaunchStage::Launched);

    let cmd = &outcome.command;
    let words = argv(cmd);
    assert_eq!(
        words[..13],
        [
            "qemu-system-x86_64", "-smp", "2", "-m", "2048", "-enable-kvm", "-vga", "virtio",
            "-machine", "q35", "-boot", "once=dc", "-netdev",
        ]
    );
    assert!(words[13].starts_with("tap,id=nic0,ifname=tap"));
    assert!(has_opt(&words, "-serial", "mon:telnet:127.0.0.1:10000,server,nowait"));
    assert!(has_opt(&words, "-qmp", "tcp:127.0.0.1:10001,server,nowait"));
    assert!(has_opt(&words, "-vnc", ":0,websocket=5800"));
    assert_eq!(words.last().map(String::as_str), Some("-usb"));

    // Order of host actions: preflight, network, NAT, DHCP, web VNC, QEMU
    let mutations = runner.mutations();
    let pos = |prefix: &str| {
        mutations
            .iter()
            .position(|c| c.starts_with(prefix))
            .unwrap_or_else(|| panic!("{} not run: {:?}", prefix, mutations))
    };
    assert_eq!(pos("rm -f /dev/tmp-vhost-net"), 0);
    assert!(pos("ip link add dev tapbr") < pos("iptables"));
    assert!(pos("iptables") < pos("dnsmasq"));
    assert!(pos("dnsmasq") < pos("caddy start --config /etc/caddy/Caddyfile"));
    assert_eq!(mutations.last().unwrap(), &format!("sh -c exec {}", cmd));

    let net = launcher.network().unwrap();
    assert_eq!(net.gateway.to_string(), "172.17.0.1");
}

#[tokio::test]
async fn test_missing_capability_aborts_before_mutation() {
    let runner = common::container_host();
    let config = common::config(&["--macvlan"]);
    let mut launcher = Launcher::new(&runner, config, HostCapabilities { net_admin: false });

    let err = launcher.run().await.unwrap_err();
    assert!(classify(&err).is_some_and(|e| e.is_permission()));
    assert!(runner.mutations().is_empty());
    assert_eq!(launcher.stage(), LaunchStage::Created);
}

#[tokio::test]
async fn test_failure_leaves_stage_for_inspection() {
    let runner = common::container_host();
    let config = common::config(&["--iface", "eth9"]);
    let mut launcher = Launcher::new(&runner, config, CAPS);

    let err = launcher.run().await.unwrap_err();
    assert!(classify(&err).is_some_and(|e| e.is_config()));
    assert_eq!(launcher.stage(), LaunchStage::BootConfigured);
    assert!(runner.matching("sh -c exec").is_empty());
}

#[tokio::test]
async fn test_toggles_skip_stages() {
    let runner = common::container_host();
    let config = common::config(&["--no-netdev", "--no-console", "--no-vnc-web", "--vga", "-", "--boot", "-"]);
    let mut launcher = Launcher::new(&runner, config, CAPS);

    let outcome = launcher.run().await.unwrap();
    assert_eq!(outcome.command, "qemu-system-x86_64 -enable-kvm -machine q35");
    assert!(runner.matching("ip link").is_empty());
    assert!(runner.matching("iptables").is_empty());
    assert!(runner.matching("dnsmasq").is_empty());
    assert!(runner.matching("caddy").is_empty());
    assert!(launcher.network().is_none());
}

#[tokio::test]
async fn test_no_dhcp_keeps_port_forwards() {
    let runner = common::container_host();
    let config = common::config(&["--no-dhcp", "--port", "80:8080"]);
    let mut launcher = Launcher::new(&runner, config, CAPS);

    launcher.run().await.unwrap();
    assert!(runner.matching("dnsmasq").is_empty());
    assert_eq!(runner.matching("iptables").len(), 2);
}

#[tokio::test]
async fn test_hooks_run_before_qemu_and_exit_code_propagates() {
    let runner = common::container_host().fail("sh -c exec qemu-system-x86_64", 3, "");
    let config = common::config(&["--exec-sh", "/hooks/a.sh", "--exec-sh", "/hooks/b.sh"]);
    let mut launcher = Launcher::new(&runner, config, CAPS);

    let outcome = launcher.run().await.unwrap();
    assert_eq!(outcome.exit_code, 3);

    let tail: Vec<String> = runner.commands().into_iter().rev().take(3).collect();
    assert!(tail[0].starts_with("sh -c exec qemu-system-x86_64"));
    assert_eq!(tail[1], "sh /hooks/b.sh");
    assert_eq!(tail[2], "sh /hooks/a.sh");
}

#[tokio::test]
async fn test_failing_hook_aborts_launch() {
    let runner = common::container_host().fail("sh /hooks/a.sh", 1, "");
    let config = common::config(&["--exec-sh", "/hooks/a.sh"]);
    let mut launcher = Launcher::new(&runner, config, CAPS);

    assert!(launcher.run().await.is_err());
    assert!(runner.matching("sh -c exec").is_empty());
    assert_eq!(launcher.stage(), LaunchStage::VncConfigured);
}

#[tokio::test]
async fn test_accelerator_fallback_without_kvm() {
    let runner = common::container_host()
        .with_file("/proc/cpuinfo", "flags\t\t: fpu vme lm\n")
        .respond("qemu-system-x86_64 -accel help", "Accelerators supported in QEMU binary:\ntcg\n");
    let config = common::config(&["--no-netdev"]);
    let mut launcher = Launcher::new(&runner, config, CAPS);

    let outcome = launcher.run().await.unwrap();
    assert!(outcome.command.starts_with("qemu-system-x86_64 -accel tcg"));
}

#[tokio::test(start_paused = true)]
async fn test_windows_guest_without_tpm_socket_continues() {
    let runner = common::container_host();
    let config = common::config(&["--no-netdev", "--windows", "--disk", "data:8G"]);
    let mut launcher = Launcher::new(&runner, config, CAPS);

    let outcome = launcher.run().await.unwrap();
    let cmd = &outcome.command;
    assert!(!cmd.contains("tpmdev"));
    assert!(cmd.contains("if=ide"));
    assert!(has_opt(
        &argv(cmd),
        "-drive",
        "file=/storage/boot/windows.rom,if=pflash,format=raw,readonly=on"
    ));
    assert_eq!(runner.matching("swtpm socket").len(), 1);
    assert_eq!(runner.matching("qemu-img create -f qcow2").len(), 1);
}

#[tokio::test]
async fn test_windows_guest_with_tpm_and_virtio() {
    let runner = common::container_host().with_file("/run/swtpm-sock", "");
    let config = common::config(&["--no-netdev", "--windows", "--virtio-iso", "/isos/virtio.iso", "--disk", "data"]);
    let mut launcher = Launcher::new(&runner, config, CAPS);

    let outcome = launcher.run().await.unwrap();
    let cmd = &outcome.command;
    let words = argv(cmd);
    assert!(has_opt(&words, "-drive", "file=/isos/virtio.iso,if=ide,media=cdrom,readonly=on"));
    assert!(has_opt(&words, "-tpmdev", "emulator,id=tpm0,chardev=chrtpm"));
    assert!(has_opt(&words, "-device", "tpm-tis,tpmdev=tpm0"));
    assert!(cmd.contains("@data.qcow2,if=virtio"));
}

#[tokio::test]
async fn test_arguments_with_spaces_stay_whole() {
    let runner = common::container_host();
    let config = common::config(&[
        "--no-netdev", "--no-console", "--no-vnc-web",
        "--iso", "/isos/my disc.iso",
        "--", "-name", "my vm", "-append", "console=ttyS0; reboot",
    ]);
    let mut launcher = Launcher::new(&runner, config, CAPS);

    let outcome = launcher.run().await.unwrap();
    let words = argv(&outcome.command);
    assert!(has_opt(&words, "-cdrom", "/isos/my disc.iso"));
    assert_eq!(words[words.len() - 4..], ["-name", "my vm", "-append", "console=ttyS0; reboot"]);
    assert_eq!(
        runner.matching("sh -c exec"),
        vec![format!("sh -c exec {}", outcome.command)]
    );
}

#[tokio::test]
async fn test_macvlan_redirections_stay_raw() {
    let runner = common::container_host();
    let config = common::config(&["--macvlan", "--no-console", "--no-vnc-web", "--", "-name", "my vm"]);
    let mut launcher = Launcher::new(&runner, config, CAPS);

    let outcome = launcher.run().await.unwrap();
    let cmd = &outcome.command;
    assert!(cmd.contains(" 10<>/dev/macvtap"));
    assert!(cmd.contains(" 11<>/dev/vhost-net "));
    let words = argv(cmd);
    assert!(words.iter().any(|w| w == "11<>/dev/vhost-net"));
    assert_eq!(words[words.len() - 2..], ["-name", "my vm"]);
}

#[tokio::test]
async fn test_no_port_forward_installs_no_rules() {
    let runner = common::container_host();
    let config = common::config(&["--no-port-forward"]);
    let mut launcher = Launcher::new(&runner, config, CAPS);

    launcher.run().await.unwrap();
    assert!(runner.matching("iptables").is_empty());
    assert_eq!(runner.matching("dnsmasq").len(), 1);
    assert_eq!(launcher.stage(), LaunchStage::Launched);
}

#[tokio::test]
async fn test_dry_run_plan_records_only_mutations() {
    let runner = DryRunRunner::over(common::container_host());
    let config = common::config(&["--port", "80:8080"]);

    let plan = LaunchPlan::dry_run(&runner, config, CAPS).await.unwrap();

    let cmds = &plan.host_commands;
    assert!(cmds.iter().any(|c| c.starts_with("ip link add dev tapbr")));
    assert!(cmds
        .iter()
        .any(|c| c.starts_with("iptables -t nat -A PREROUTING -p tcp --dport 8080")));
    assert!(!cmds.iter().any(|c| c.starts_with("ip route show")
        || c.starts_with("ip -o link show")
        || c.starts_with("ping")
        || c.contains("-machine help")));
    assert_eq!(cmds.last(), Some(&format!("sh -c exec {}", plan.command)));
    assert!(runner.inner().mutations().is_empty());

    let json = serde_json::to_value(&plan).unwrap();
    assert_eq!(json["network"]["gateway"], "172.17.0.1");
    assert_eq!(json["network"]["interfaces"][0]["iface"], "eth0");
}
