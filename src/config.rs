//! Per-launch runtime configuration.

use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing::info;

use crate::cli::RunArgs;
use crate::error::LaunchError;
use crate::network::{Ipv4Cidr, NetworkMode, PortMapping};
use crate::paths;
use crate::qemu::disk::DiskSpec;
use crate::qemu::{BootMode, QemuOpts};

/// Windows guest options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowsOpts {
    pub virtio_iso: Option<String>,
    pub enable_tpm: bool,
}

/// Everything one launch needs; the option tree is filled in as stages run.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub qemu: QemuOpts,

    pub arch: String,
    pub cpu_num: Option<u32>,
    /// Memory in MB
    pub mem_size: Option<u32>,
    pub iso: Option<String>,
    pub vga: Option<String>,
    pub enable_accel: bool,

    pub network_mode: NetworkMode,
    pub setup_netdev: bool,
    pub enable_dhcp: bool,
    pub enable_vnc_web: bool,
    pub enable_console: bool,

    pub machine: Option<String>,
    pub boot: Option<String>,
    pub boot_mode: BootMode,

    pub ifaces: Vec<String>,
    pub networks: Vec<Ipv4Cidr>,
    /// `None` when no forward was declared
    pub port_forwards: Option<Vec<String>>,

    pub windows: Option<WindowsOpts>,
    pub disks: Vec<DiskSpec>,
    pub exec_files: Vec<PathBuf>,
    pub extra_args: Vec<String>,

    pub storage_dir: PathBuf,
    pub dry_run: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            qemu: QemuOpts::new(),
            arch: "x86_64".to_string(),
            cpu_num: None,
            mem_size: None,
            iso: None,
            vga: Some("virtio".to_string()),
            enable_accel: true,
            network_mode: NetworkMode::TapBridge,
            setup_netdev: true,
            enable_dhcp: true,
            enable_vnc_web: true,
            enable_console: true,
            machine: None,
            boot: Some("once=dc".to_string()),
            boot_mode: BootMode::Legacy,
            ifaces: Vec::new(),
            networks: Vec::new(),
            port_forwards: None,
            windows: None,
            disks: Vec::new(),
            exec_files: Vec::new(),
            extra_args: Vec::new(),
            storage_dir: PathBuf::from(paths::FALLBACK_STORAGE_DIR),
            dry_run: false,
        }
    }
}

/// `-` on the command line switches a defaulted option off.
fn str_or_none(value: String) -> Option<String> {
    match value.trim() {
        "-" | "" => None,
        _ => Some(value),
    }
}

impl RuntimeConfig {
    /// Builds the configuration from command-line arguments.
    ///
    /// All user input is validated here, before the host is touched.
    pub fn from_args(args: RunArgs) -> Result<Self> {
        let networks = args
            .networks
            .iter()
            .map(|n| n.parse::<Ipv4Cidr>().map(|c| c.network()))
            .collect::<Result<Vec<_>>>()
            .context("parsing --network")?;

        if let Some(ports) = &args.ports {
            for spec in ports {
                PortMapping::parse(spec).context("parsing --port")?;
            }
        }

        let disks = args
            .disks
            .iter()
            .map(|d| d.parse::<DiskSpec>())
            .collect::<Result<Vec<_>>>()
            .context("parsing --disk")?;

        if args.arch.trim().is_empty() {
            return Err(LaunchError::config("--arch must not be empty"));
        }

        let windows = args.windows.then(|| WindowsOpts {
            virtio_iso: args.virtio_iso.clone(),
            enable_tpm: !args.no_tpm,
        });

        let mut boot_mode = BootMode::from(args.boot_mode);
        if windows.is_some() && boot_mode == BootMode::Legacy {
            info!("windows guest: switching boot mode from legacy to windows");
            boot_mode = BootMode::Windows;
        }

        Ok(Self {
            qemu: QemuOpts::new(),
            arch: args.arch,
            cpu_num: args.cpu,
            mem_size: args.mem,
            iso: args.iso,
            vga: str_or_none(args.vga),
            enable_accel: !args.no_accel,
            network_mode: if args.macvlan {
                NetworkMode::Macvlan
            } else {
                NetworkMode::TapBridge
            },
            setup_netdev: !args.no_netdev,
            enable_dhcp: !args.no_dhcp,
            enable_vnc_web: !args.no_vnc_web,
            enable_console: !args.no_console,
            machine: args.machine,
            boot: str_or_none(args.boot),
            boot_mode,
            ifaces: args.ifaces,
            networks,
            port_forwards: if args.no_port_forward {
                Some(Vec::new())
            } else {
                args.ports
            },
            windows,
            disks,
            exec_files: args.exec_sh,
            extra_args: args.extra,
            storage_dir: paths::storage_dir(args.storage_dir.as_deref()),
            dry_run: args.dry,
        })
    }

    pub fn is_windows(&self) -> bool {
        self.windows.is_some()
    }

    /// Disk bus for data disks: IDE unless the guest can load virtio drivers.
    pub fn disk_interface(&self) -> &'static str {
        match &self.windows {
            Some(w) if w.virtio_iso.is_none() => "ide",
            _ => "virtio",
        }
    }
}
