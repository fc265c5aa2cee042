use anyhow::{Context, Result};
use serde::Serialize;
use std::net::Ipv4Addr;
use tracing::{info, warn};

use crate::cli::RunArgs;
use crate::config::RuntimeConfig;
use crate::exec::{sh, sh_inherit, CommandRunner, DryRunRunner, HostCommand, HostRunner};
use crate::network::{configure_dhcp, configure_network, configure_port_forward, BridgeResult};
use crate::qemu::boot::configure_boot;
use crate::qemu::disk::{apply_disk, vm_id};
use crate::qemu::probe::{is_kvm_available, qemu_accels};
use crate::qemu::tpm::setup_swtpm;
use crate::qemu::{qemu_binary, QemuOpt, VmPort};
use crate::setup::{check_capabilities, HostCapabilities};

const CADDYFILE: &str = "/etc/caddy/Caddyfile";

/// Last stage a launch completed. Stages disabled by configuration still count
/// as passed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum LaunchStage {
    Created,
    Preflight,
    OptsAssembled,
    BootConfigured,
    NetworkConfigured,
    PortForwardConfigured,
    DhcpConfigured,
    ConsoleConfigured,
    VncConfigured,
    Launched,
}

/// Network state handed from bridge setup to the NAT and DHCP stages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkSummary {
    pub gateway: Ipv4Addr,
    #[serde(flatten)]
    pub bridges: BridgeResult,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchOutcome {
    pub command: String,
    pub exit_code: i32,
}

/// What a dry run would have done.
#[derive(Debug, Serialize)]
pub struct LaunchPlan {
    pub command: String,
    pub host_commands: Vec<String>,
    pub network: Option<NetworkSummary>,
}

impl LaunchPlan {
    /// Walks the full launch against `runner`, which only records mutations.
    pub async fn dry_run<R: CommandRunner>(
        runner: &DryRunRunner<R>,
        config: RuntimeConfig,
        caps: HostCapabilities,
    ) -> Result<Self> {
        let mut launcher = Launcher::new(runner, config, caps);
        let outcome = launcher.run().await?;
        Ok(Self {
            command: outcome.command,
            host_commands: runner.recorded(),
            network: launcher.network().cloned(),
        })
    }
}

/// Drives one launch through its stages, in order.
///
/// A failed stage aborts the launch and leaves host changes in place;
/// [`Launcher::stage`] reports how far it got.
pub struct Launcher<'a> {
    runner: &'a dyn CommandRunner,
    config: RuntimeConfig,
    caps: HostCapabilities,
    stage: LaunchStage,
    network: Option<NetworkSummary>,
}

impl<'a> Launcher<'a> {
    pub fn new(runner: &'a dyn CommandRunner, config: RuntimeConfig, caps: HostCapabilities) -> Self {
        Self {
            runner,
            config,
            caps,
            stage: LaunchStage::Created,
            network: None,
        }
    }

    pub fn stage(&self) -> LaunchStage {
        self.stage
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn network(&self) -> Option<&NetworkSummary> {
        self.network.as_ref()
    }

    /// Full command line handed to the shell.
    ///
    /// Every option value and extra argument is quoted as one word; only the
    /// fd redirections are left for the shell to interpret.
    pub fn command_line(&self) -> String {
        let mut words = vec![qemu_binary(&self.config.arch)];
        words.extend(self.config.qemu.argv());
        let mut line = shell_words::join(&words);
        for redirect in self.config.qemu.ext_args() {
            line.push(' ');
            line.push_str(redirect);
        }
        if !self.config.extra_args.is_empty() {
            line.push(' ');
            line.push_str(&shell_words::join(&self.config.extra_args));
        }
        line
    }

    async fn preflight(&mut self) -> Result<()> {
        let macvlan = self.config.setup_netdev
            && self.config.network_mode == crate::network::NetworkMode::Macvlan;
        check_capabilities(self.runner, self.caps, macvlan).await
    }

    async fn assemble_opts(&mut self) -> Result<()> {
        let runner = self.runner;
        let c = &mut self.config;

        if let Some(cpu) = c.cpu_num {
            c.qemu.append(QemuOpt::value("smp", cpu));
        }
        if let Some(mem) = c.mem_size {
            c.qemu.append(QemuOpt::value("m", mem));
        }

        if c.enable_accel {
            if is_kvm_available(runner).await {
                c.qemu.append(QemuOpt::flag("enable-kvm"));
            } else if let Some(accel) = qemu_accels(runner, &c.arch).await?.into_iter().next() {
                info!(accel = %accel, "kvm unavailable, using accelerator");
                c.qemu.append(QemuOpt::value("accel", accel));
            }
        }

        if let Some(iso) = &c.iso {
            c.qemu.append(QemuOpt::value("cdrom", iso));
        }
        if let Some(vga) = &c.vga {
            c.qemu.append(QemuOpt::value("vga", vga));
        }

        if let Some(win) = c.windows.clone() {
            match &win.virtio_iso {
                Some(iso) => c.qemu.append(QemuOpt::value(
                    "drive",
                    format!("file={},if=ide,media=cdrom,readonly=on", iso),
                )),
                None => info!(
                    "for better Windows VM performance, consider providing the VirtIO driver ISO \
                     (https://fedorapeople.org/groups/virt/virtio-win/direct-downloads/stable-virtio)"
                ),
            }
            if win.enable_tpm {
                if let Err(e) = setup_swtpm(runner, &mut c.qemu).await {
                    warn!(error = %format!("{:#}", e), "failed to setup swtpm, ignoring TPM support");
                }
            }
        }

        if !c.disks.is_empty() {
            let id = vm_id(runner, &c.storage_dir).await?;
            let if_type = c.disk_interface();
            for disk in c.disks.clone() {
                let (_, opt) = apply_disk(runner, &c.storage_dir, &id, &disk, if_type).await?;
                c.qemu.append(opt);
            }
        }
        Ok(())
    }

    fn configure_console(&mut self) {
        self.config.qemu.append(QemuOpt::value(
            "serial",
            format!("mon:telnet:127.0.0.1:{},server,nowait", VmPort::TELNET),
        ));
        self.config.qemu.append(QemuOpt::value(
            "qmp",
            format!("tcp:127.0.0.1:{},server,nowait", VmPort::QMP),
        ));
    }

    async fn configure_vnc(&mut self) -> Result<()> {
        self.config
            .qemu
            .append(QemuOpt::value("vnc", format!(":0,websocket={}", VmPort::VNC_WS)));
        info!("starting caddy");
        sh(
            self.runner,
            HostCommand::new("caddy").args(["start", "--config", CADDYFILE]),
        )
        .await
        .context("starting caddy")?;
        Ok(())
    }

    /// Runs every stage up to, but not including, the QEMU launch.
    pub async fn prepare(&mut self) -> Result<()> {
        self.preflight().await.context("capability preflight")?;
        self.stage = LaunchStage::Preflight;

        self.assemble_opts().await.context("assembling qemu options")?;
        self.stage = LaunchStage::OptsAssembled;

        configure_boot(self.runner, &mut self.config)
            .await
            .context("configuring boot")?;
        self.stage = LaunchStage::BootConfigured;

        if self.config.setup_netdev {
            let (gateway, bridges) = configure_network(self.runner, &mut self.config)
                .await
                .context("configuring network")?;
            self.network = Some(NetworkSummary { gateway, bridges });
        } else {
            info!("network setup disabled");
        }
        self.stage = LaunchStage::NetworkConfigured;

        if let Some(net) = &self.network {
            configure_port_forward(
                self.runner,
                self.config.port_forwards.as_deref(),
                net.gateway,
                &net.bridges,
            )
            .await
            .context("configuring port forwards")?;
        }
        self.stage = LaunchStage::PortForwardConfigured;

        if let Some(net) = &self.network {
            if self.config.enable_dhcp {
                configure_dhcp(self.runner, net.gateway, &net.bridges)
                    .await
                    .context("configuring dhcp")?;
            }
        }
        self.stage = LaunchStage::DhcpConfigured;

        if self.config.enable_console {
            self.configure_console();
        }
        self.stage = LaunchStage::ConsoleConfigured;

        if self.config.enable_vnc_web {
            self.configure_vnc().await?;
        }
        self.stage = LaunchStage::VncConfigured;

        Ok(())
    }

    /// Runs hook scripts, then QEMU in the foreground.
    pub async fn launch(&mut self) -> Result<LaunchOutcome> {
        for file in &self.config.exec_files {
            info!(file = %file.display(), "running hook");
            sh_inherit(self.runner, HostCommand::new("sh").arg(file.display().to_string()))
                .await
                .with_context(|| format!("running hook {}", file.display()))?;
        }

        let command = self.command_line();
        info!(command = %command, "starting qemu");
        // The fd redirections in the command line need a shell
        let exit_code = sh_inherit(
            self.runner,
            HostCommand::shell(format!("exec {}", command)).unchecked(),
        )
        .await?;
        self.stage = LaunchStage::Launched;

        if exit_code != 0 {
            warn!(exit_code, "qemu exited with failure");
        }
        Ok(LaunchOutcome { command, exit_code })
    }

    pub async fn run(&mut self) -> Result<LaunchOutcome> {
        self.prepare().await?;
        self.launch().await
    }
}

/// `cvm run`: returns the exit code for the process.
pub async fn cmd_run(args: RunArgs) -> Result<i32> {
    let config = RuntimeConfig::from_args(args)?;
    let caps = HostCapabilities::probe();

    if config.dry_run {
        let plan = LaunchPlan::dry_run(&DryRunRunner::new(), config, caps).await?;
        println!(
            "{}",
            serde_json::to_string_pretty(&plan).context("serializing launch plan")?
        );
        return Ok(0);
    }

    let runner = HostRunner;
    let mut launcher = Launcher::new(&runner, config, caps);
    let outcome = launcher.run().await?;
    Ok(outcome.exit_code)
}
