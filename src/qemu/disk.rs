//! Persistent data disks.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::info;
use uuid::Uuid;

use super::opts::QemuOpt;
use crate::error::LaunchError;
use crate::exec::{sh, CommandRunner, HostCommand};
use crate::paths;

pub const DEFAULT_DISK_SIZE: &str = "16G";
pub const DISK_FORMAT: &str = "qcow2";

/// `NAME[:SIZE]` from the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskSpec {
    pub name: String,
    pub size: String,
}

fn valid_size(size: &str) -> bool {
    let digits = size.trim_end_matches(|c: char| "kKMGTPE".contains(c));
    // At most one unit suffix
    size.len() - digits.len() <= 1 && !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit())
}

impl FromStr for DiskSpec {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (name, size) = match s.split_once(':') {
            Some((name, size)) => (name, size),
            None => (s, DEFAULT_DISK_SIZE),
        };

        if name.is_empty() || name.contains('/') || name.contains('@') {
            return Err(LaunchError::config(format!("invalid disk name in {:?}", s)));
        }
        if !valid_size(size) {
            return Err(LaunchError::config(format!("invalid disk size in {:?}", s)));
        }

        Ok(Self {
            name: name.to_string(),
            size: size.to_string(),
        })
    }
}

/// The id naming this VM's disks, created on first use.
pub async fn vm_id(runner: &dyn CommandRunner, storage_dir: &Path) -> Result<String> {
    let file = paths::vm_id_file(storage_dir);
    if let Ok(existing) = runner.read_to_string(&file).await {
        let existing = existing.trim();
        if !existing.is_empty() {
            return Ok(existing.to_string());
        }
    }

    let id = Uuid::new_v4().simple().to_string()[..8].to_string();
    sh(
        runner,
        HostCommand::new("mkdir").arg("-p").arg(storage_dir.display().to_string()),
    )
    .await?;
    let target = file.display().to_string();
    sh(
        runner,
        HostCommand::shell(format!("printf %s {} > {}", id, shell_words::quote(&target))),
    )
    .await
    .with_context(|| format!("writing {}", file.display()))?;

    info!(vm_id = %id, "generated vm id");
    Ok(id)
}

/// Creates the disk image if needed and returns its drive option.
///
/// `if_type` is `virtio` unless the guest has no virtio drivers.
pub async fn apply_disk(
    runner: &dyn CommandRunner,
    storage_dir: &Path,
    vm_id: &str,
    spec: &DiskSpec,
    if_type: &str,
) -> Result<(PathBuf, QemuOpt)> {
    let file = paths::disk_file(storage_dir, vm_id, &spec.name, DISK_FORMAT);

    if runner.exists(&file).await {
        info!(file = %file.display(), "disk already exists, skip creating");
    } else {
        info!(file = %file.display(), size = %spec.size, "creating disk");
        sh(
            runner,
            HostCommand::new("qemu-img")
                .args(["create", "-f", DISK_FORMAT])
                .arg(file.display().to_string())
                .arg(spec.size.clone()),
        )
        .await
        .with_context(|| format!("creating disk {}", spec.name))?;
    }

    let opt = QemuOpt::value("drive", format!("file={},if={}", file.display(), if_type));
    Ok((file, opt))
}
