use std::path::{Path, PathBuf};

/// Preferred persistent storage, usually a volume mounted by the container runtime
pub const DEFAULT_STORAGE_DIR: &str = "/storage";

/// Fallback when no volume is mounted, relative to the working directory
pub const FALLBACK_STORAGE_DIR: &str = ".storage";

/// Base directory for all VM data
///
/// An explicit directory wins; otherwise `/storage` if it exists, else `.storage`.
pub fn storage_dir(explicit: Option<&Path>) -> PathBuf {
    if let Some(dir) = explicit {
        return dir.to_path_buf();
    }
    if Path::new(DEFAULT_STORAGE_DIR).is_dir() {
        PathBuf::from(DEFAULT_STORAGE_DIR)
    } else {
        PathBuf::from(FALLBACK_STORAGE_DIR)
    }
}

/// Directory for cached firmware images
pub fn boot_dir(storage_dir: &Path) -> PathBuf {
    storage_dir.join("boot")
}

/// File holding the persistent VM id
pub fn vm_id_file(storage_dir: &Path) -> PathBuf {
    storage_dir.join("vm-id")
}

/// Data disk image for `name`
pub fn disk_file(storage_dir: &Path, vm_id: &str, name: &str, format: &str) -> PathBuf {
    storage_dir.join(format!("{}@{}.{}", vm_id, name, format))
}
