//! Filesystem formatting

use crate::utils::command::CommandRunner;
use crate::utils::error::{ProvisionError, Result};
use std::path::Path;
use tracing::info;

/// Format a device as btrfs
pub fn format_btrfs(cmd: &CommandRunner, device: &str, label: &str) -> Result<()> {
    info!("Formatting {} as btrfs (label {})", device, label);

    cmd.run("mkfs.btrfs", &["-f", "-L", label, device])
        .map(|_| ())
        .map_err(|e| ProvisionError::FormatFailed(format!("{}: {}", device, e)))
}

/// Format the EFI partition as FAT32
pub fn format_efi(cmd: &CommandRunner, partition: &str) -> Result<()> {
    info!("Formatting {} as FAT32 (EFI)", partition);

    cmd.run("mkfs.vfat", &["-F32", "-n", "EFI", partition])
        .map(|_| ())
        .map_err(|e| ProvisionError::FormatFailed(format!("EFI partition {}: {}", partition, e)))
}

/// Create a btrfs subvolume at `path` (inside a mounted top-level volume)
pub fn create_subvolume(cmd: &CommandRunner, path: &Path) -> Result<()> {
    let path = path.to_string_lossy();
    info!("Creating btrfs subvolume {}", path);

    cmd.run("btrfs", &["subvolume", "create", &path])
        .map(|_| ())
        .map_err(|e| ProvisionError::FormatFailed(format!("subvolume {}: {}", path, e)))
}

/// Filesystem type on a device, if blkid recognises one
pub fn filesystem_type(cmd: &CommandRunner, device: &str) -> Option<String> {
    cmd.query_optional("blkid", &["-s", "TYPE", "-o", "value", device])
        .filter(|t| !t.is_empty())
}

/// Get the filesystem UUID of a formatted device
pub fn filesystem_uuid(cmd: &CommandRunner, device: &str) -> Result<String> {
    let uuid = cmd
        .query("blkid", &["-s", "UUID", "-o", "value", device])
        .map_err(|e| ProvisionError::FormatFailed(format!("no UUID for {}: {}", device, e)))?;

    if uuid.is_empty() {
        return Err(ProvisionError::FormatFailed(format!(
            "Failed to get UUID for {}",
            device
        )));
    }
    Ok(uuid)
}
