//! Rollback and cleanup
//!
//! [`Rollback`] remembers what a provisioning run mounted and opened and
//! tears it down in reverse order when the run fails. [`Cleaner`] does the
//! same for a previous run it knows nothing about, working from the live
//! mount table.

use crate::configure::encryption::close_luks;
use crate::utils::command::CommandRunner;
use crate::utils::error::Result;
use std::fs;
use std::path::Path;
use tracing::{info, warn};

/// Unmount `target`, falling back to a lazy unmount
fn unmount(cmd: &CommandRunner, target: &str) -> bool {
    info!("Unmounting {}", target);
    if let Err(e) = cmd.run("umount", &[target]) {
        warn!("Failed to unmount {}: {} (trying lazy unmount)", target, e);
        if let Err(e2) = cmd.run("umount", &["-l", target]) {
            warn!("Lazy unmount also failed for {}: {}", target, e2);
            return false;
        }
    }
    true
}

/// Resources acquired by a provisioning run, in acquisition order
#[derive(Debug, Default)]
pub struct Rollback {
    mounts: Vec<String>,
    containers: Vec<String>,
}

impl Rollback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track_mount(&mut self, target: &str) {
        self.mounts.push(target.to_string());
    }

    /// Forget a mount that was already released normally
    pub fn untrack_mount(&mut self, target: &str) {
        if let Some(pos) = self.mounts.iter().rposition(|m| m == target) {
            self.mounts.remove(pos);
        }
    }

    pub fn track_container(&mut self, mapper_name: &str) {
        self.containers.push(mapper_name.to_string());
    }

    pub fn mounts(&self) -> &[String] {
        &self.mounts
    }

    pub fn containers(&self) -> &[String] {
        &self.containers
    }

    pub fn is_empty(&self) -> bool {
        self.mounts.is_empty() && self.containers.is_empty()
    }

    /// Unmount everything in reverse mount order, then close containers.
    ///
    /// Best effort: keeps going past individual failures. Returns `true`
    /// when every resource was released.
    pub fn rollback(&mut self, cmd: &CommandRunner) -> bool {
        if self.is_empty() {
            return true;
        }
        info!(
            "Rolling back: {} mounts, {} containers",
            self.mounts.len(),
            self.containers.len()
        );

        let mut clean = true;
        while let Some(target) = self.mounts.pop() {
            clean &= unmount(cmd, &target);
        }
        while let Some(name) = self.containers.pop() {
            clean &= close_luks(cmd, &name);
        }

        if clean {
            info!("Rollback complete (all resources released)");
        } else {
            warn!("Rollback incomplete; run `diskprep cleanup` after fixing the cause");
        }
        clean
    }
}

/// Mount points at or below `root` in a `/proc/mounts`-style listing,
/// deepest first
pub fn mounts_under(mount_table: &str, root: &str) -> Vec<String> {
    let root = root.trim_end_matches('/');
    let mut mount_points: Vec<String> = mount_table
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        // /proc/mounts escapes spaces as \040
        .map(|mp| mp.replace("\\040", " "))
        .filter(|mp| mp == root || mp.starts_with(&format!("{}/", root)))
        .collect();

    mount_points.sort_by_key(|mp| std::cmp::Reverse(mp.matches('/').count()));
    mount_points.dedup();
    mount_points
}

/// Cleanup utility for leftovers of an earlier, interrupted run
pub struct Cleaner<'a> {
    cmd: &'a CommandRunner,
}

impl<'a> Cleaner<'a> {
    pub fn new(cmd: &'a CommandRunner) -> Self {
        Self { cmd }
    }

    /// Unmount everything under `mount_root` and close `mapper_name` if it
    /// is open
    pub fn cleanup(&self, mount_root: &str, mapper_name: Option<&str>) -> Result<()> {
        info!("Starting cleanup of {}", mount_root);

        let table = fs::read_to_string("/proc/mounts")?;
        self.unmount_all(&table, mount_root);

        if let Some(name) = mapper_name {
            if Path::new(&crate::configure::encryption::mapped_path(name)).exists() {
                close_luks(self.cmd, name);
            }
        }

        info!("Cleanup complete");
        Ok(())
    }

    /// Unmount every mount under `mount_root` listed in `mount_table`
    pub fn unmount_all(&self, mount_table: &str, mount_root: &str) -> usize {
        let targets = mounts_under(mount_table, mount_root);
        targets.iter().filter(|mp| unmount(self.cmd, mp)).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::mock::MockDisk;

    const MOUNTS: &str = "\
proc /proc proc rw,nosuid 0 0
/dev/mapper/cryptroot /mnt btrfs rw,noatime,subvol=/@ 0 0
/dev/mapper/cryptroot /mnt/home btrfs rw,noatime,subvol=/@home 0 0
/dev/mapper/cryptroot /mnt/var/log btrfs rw,noatime,subvol=/@log 0 0
/dev/sda1 /mnt/boot vfat rw 0 0
/dev/sdb1 /mnt2 ext4 rw 0 0
";

    #[test]
    fn mounts_under_root_deepest_first() {
        let mounts = mounts_under(MOUNTS, "/mnt/");
        assert_eq!(mounts[0], "/mnt/var/log");
        assert_eq!(mounts.last().unwrap(), "/mnt");
        assert_eq!(mounts.len(), 4);
        assert!(!mounts.iter().any(|m| m == "/mnt2"));
    }

    #[test]
    fn rollback_releases_in_reverse_order() {
        let disk = MockDisk::empty("/dev/sda", 20 << 30);
        let cmd = disk.runner();
        disk.force_mount("/dev/mapper/cryptroot", "/mnt");
        disk.force_mount("/dev/mapper/cryptroot", "/mnt/home");
        disk.force_open_mapping("cryptroot");

        let mut rollback = Rollback::new();
        rollback.track_container("cryptroot");
        rollback.track_mount("/mnt");
        rollback.track_mount("/mnt/home");

        assert!(rollback.rollback(&cmd));
        assert!(rollback.is_empty());
        assert!(disk.mounts().is_empty());
        assert!(disk.open_mappings().is_empty());

        let commands: Vec<String> = cmd
            .audit_log()
            .entries()
            .iter()
            .map(|e| e.command.clone())
            .collect();
        assert_eq!(
            commands,
            vec!["umount /mnt/home", "umount /mnt", "cryptsetup close cryptroot"]
        );
    }

    #[test]
    fn untracked_mounts_are_left_alone() {
        let disk = MockDisk::empty("/dev/sda", 20 << 30);
        let cmd = disk.runner();
        disk.force_mount("/dev/sda2", "/mnt");

        let mut rollback = Rollback::new();
        rollback.track_mount("/mnt");
        rollback.untrack_mount("/mnt");
        assert!(rollback.rollback(&cmd));
        assert_eq!(disk.mounts().len(), 1);
    }

    #[test]
    fn cleaner_unmounts_from_table() {
        let disk = MockDisk::empty("/dev/sda", 20 << 30);
        let cmd = disk.runner();
        for line in MOUNTS.lines() {
            let fields: Vec<&str> = line.split_whitespace().collect();
            disk.force_mount(fields[0], fields[1]);
        }

        let released = Cleaner::new(&cmd).unmount_all(MOUNTS, "/mnt");
        assert_eq!(released, 4);
        let remaining: Vec<String> = disk.mounts().into_iter().map(|(_, target)| target).collect();
        assert_eq!(remaining, vec!["/proc", "/mnt2"]);
    }
}
