use super::args::BootModeOpt;
use crate::qemu::BootMode;

impl From<BootModeOpt> for BootMode {
    fn from(m: BootModeOpt) -> Self {
        match m {
            BootModeOpt::Legacy => BootMode::Legacy,
            BootModeOpt::Uefi => BootMode::Uefi,
            BootModeOpt::Secure => BootMode::Secure,
            BootModeOpt::Windows => BootMode::Windows,
        }
    }
}
