use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "cvm", version, about = "Run a QEMU virtual machine from inside a container")]
pub struct Cli {
    #[command(subcommand)]
    pub cmd: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Set up networking and launch the VM
    Run(RunArgs),
}

#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// CPU cores
    #[arg(short = 'c', long, env = "CVM_CPU")]
    pub cpu: Option<u32>,

    /// Memory size in MB
    #[arg(short = 'm', long, env = "CVM_MEM", value_parser = clap::value_parser!(u32).range(1..))]
    pub mem: Option<u32>,

    /// VM arch (selects qemu-system-<ARCH>)
    #[arg(long, env = "CVM_ARCH", default_value = "x86_64")]
    pub arch: String,

    /// ISO file path or drive url
    #[arg(long, env = "CVM_ISO")]
    pub iso: Option<String>,

    /// Disable hardware acceleration
    #[arg(long, env = "CVM_NO_ACCEL")]
    pub no_accel: bool,

    /// Use macvlan networking instead of a tap bridge
    #[arg(long, env = "CVM_MACVLAN")]
    pub macvlan: bool,

    /// Do not set up any network device
    #[arg(long, env = "CVM_NO_NETDEV")]
    pub no_netdev: bool,

    /// Do not run a DHCP server for the guest
    #[arg(long, env = "CVM_NO_DHCP")]
    pub no_dhcp: bool,

    /// Disable the VNC web client (noVNC)
    #[arg(long, env = "CVM_NO_VNC_WEB")]
    pub no_vnc_web: bool,

    /// Disable the QEMU monitor (mon+telnet+qmp)
    #[arg(long, env = "CVM_NO_CONSOLE")]
    pub no_console: bool,

    /// Machine type (default: q35/virt if supported)
    #[arg(long, env = "CVM_MACHINE")]
    pub machine: Option<String>,

    /// Boot options (set to '-' to disable)
    #[arg(long, env = "CVM_BOOT", default_value = "once=dc")]
    pub boot: String,

    /// VGA device (set to '-' to disable)
    #[arg(long, env = "CVM_VGA", default_value = "virtio")]
    pub vga: String,

    /// Boot mode
    #[arg(long, value_enum, env = "CVM_BOOT_MODE", default_value_t = BootModeOpt::Legacy)]
    pub boot_mode: BootModeOpt,

    /// VM network interface(s) (e.g. eth1), repeat or comma-separated
    #[arg(long = "iface", env = "CVM_IFACES", value_delimiter = ',')]
    pub ifaces: Vec<String>,

    /// VM network CIDR(s) (e.g. 192.168.1.0/24), repeat or comma-separated
    #[arg(long = "network", env = "CVM_NETWORKS", value_delimiter = ',')]
    pub networks: Vec<String>,

    /// Port forward INTERNAL:EXTERNAL[/PROTO] (default: 22:22 and 3389:3389)
    #[arg(short = 'p', long = "port", env = "CVM_PORTS", value_delimiter = ',')]
    pub ports: Option<Vec<String>>,

    /// Install no port forwards, not even the defaults
    #[arg(long, env = "CVM_NO_PORT_FORWARD", conflicts_with = "ports")]
    pub no_port_forward: bool,

    /// Windows guest
    #[arg(long, env = "CVM_WINDOWS")]
    pub windows: bool,

    /// Windows virtio driver ISO path or drive url
    #[arg(long, env = "CVM_VIRTIO_ISO", requires = "windows")]
    pub virtio_iso: Option<String>,

    /// Disable the software TPM for Windows guests
    #[arg(long, env = "CVM_NO_TPM")]
    pub no_tpm: bool,

    /// Data disk NAME[:SIZE] (default size 16G), repeat or comma-separated
    #[arg(long = "disk", env = "CVM_DISKS", value_delimiter = ',')]
    pub disks: Vec<String>,

    /// Shell script to run before starting QEMU (repeatable)
    #[arg(long = "exec-sh", env = "CVM_EXEC_SH", value_delimiter = ',')]
    pub exec_sh: Vec<PathBuf>,

    /// Directory for disks, firmware and the VM id (default: /storage, else .storage)
    #[arg(long, env = "CVM_STORAGE_DIR")]
    pub storage_dir: Option<PathBuf>,

    /// Print the launch plan instead of changing the host
    #[arg(long, env = "CVM_DRY")]
    pub dry: bool,

    /// Extra QEMU arguments, after `--`
    #[arg(last = true)]
    pub extra: Vec<String>,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug, Default, ValueEnum)]
pub enum BootModeOpt {
    #[default]
    Legacy,
    Uefi,
    Secure,
    Windows,
}
