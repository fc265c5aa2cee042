use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::info;

use super::opts::QemuOpt;
use super::probe::preferred_machine;
use crate::config::RuntimeConfig;
use crate::exec::{sh, CommandRunner, HostCommand};
use crate::paths;

pub const OVMF_DIR: &str = "/usr/share/OVMF";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BootMode {
    #[default]
    Legacy,
    Uefi,
    Secure,
    Windows,
}

impl BootMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BootMode::Legacy => "legacy",
            BootMode::Uefi => "uefi",
            BootMode::Secure => "secure",
            BootMode::Windows => "windows",
        }
    }

    /// OVMF code and vars images; legacy BIOS needs none.
    pub fn firmware(&self) -> Option<(&'static str, &'static str)> {
        match self {
            BootMode::Legacy => None,
            BootMode::Uefi => Some(("OVMF_CODE_4M.fd", "OVMF_VARS_4M.fd")),
            BootMode::Secure => Some(("OVMF_CODE_4M.secboot.fd", "OVMF_VARS_4M.secboot.fd")),
            BootMode::Windows => Some(("OVMF_CODE_4M.ms.fd", "OVMF_VARS_4M.ms.fd")),
        }
    }
}

impl fmt::Display for BootMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cached firmware images for one boot mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareFiles {
    pub rom: PathBuf,
    pub vars: PathBuf,
}

/// Copies `src` to `dst` unless `dst` already exists (the vars copy holds the guest's NVRAM).
async fn copy_once(runner: &dyn CommandRunner, src: &Path, dst: &Path) -> Result<()> {
    if runner.exists(dst).await {
        return Ok(());
    }
    sh(
        runner,
        HostCommand::new("cp").arg(src.display().to_string()).arg(dst.display().to_string()),
    )
    .await
    .with_context(|| format!("copying firmware {}", src.display()))?;
    Ok(())
}

/// Makes the firmware pair for `mode` available under `storage_dir`.
pub async fn prepare_firmware(
    runner: &dyn CommandRunner,
    storage_dir: &Path,
    mode: BootMode,
) -> Result<Option<FirmwareFiles>> {
    let Some((rom, vars)) = mode.firmware() else {
        return Ok(None);
    };

    let boot_dir = paths::boot_dir(storage_dir);
    sh(
        runner,
        HostCommand::new("mkdir").arg("-p").arg(boot_dir.display().to_string()),
    )
    .await?;

    let files = FirmwareFiles {
        rom: boot_dir.join(format!("{}.rom", mode)),
        vars: boot_dir.join(format!("{}.vars", mode)),
    };
    copy_once(runner, &Path::new(OVMF_DIR).join(rom), &files.rom).await?;
    copy_once(runner, &Path::new(OVMF_DIR).join(vars), &files.vars).await?;
    Ok(Some(files))
}

/// Appends machine type, boot order and firmware drives.
pub async fn configure_boot(runner: &dyn CommandRunner, config: &mut RuntimeConfig) -> Result<()> {
    let machine = match &config.machine {
        Some(m) => Some(m.clone()),
        None => preferred_machine(runner, &config.arch).await?,
    };
    if let Some(machine) = machine {
        info!(machine = %machine, "using machine type");
        config.qemu.append(QemuOpt::value("machine", machine));
    }

    if let Some(boot) = &config.boot {
        config.qemu.append(QemuOpt::value("boot", boot));
    }

    if let Some(fw) = prepare_firmware(runner, &config.storage_dir, config.boot_mode).await? {
        info!(boot_mode = %config.boot_mode, rom = %fw.rom.display(), "using UEFI firmware");
        config.qemu.append(QemuOpt::value(
            "drive",
            format!("file={},if=pflash,format=raw,readonly=on", fw.rom.display()),
        ));
        config.qemu.append(QemuOpt::value(
            "drive",
            format!("file={},if=pflash,format=raw", fw.vars.display()),
        ));
    }
    Ok(())
}
