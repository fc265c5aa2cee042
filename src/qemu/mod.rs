//! QEMU option assembly and the host facilities it depends on.

pub mod boot;
pub mod disk;
pub mod opts;
pub mod probe;
pub mod tpm;

pub use boot::BootMode;
pub use opts::{OptValue, QemuOpt, QemuOpts};

/// Fixed ports QEMU listens on inside the container.
pub struct VmPort;

impl VmPort {
    pub const TELNET: u16 = 10000;
    pub const QMP: u16 = 10001;
    pub const VNC_WS: u16 = 5800;
}

/// Binary name for the given guest architecture.
pub fn qemu_binary(arch: &str) -> String {
    format!("qemu-system-{}", arch)
}
