//! Partition table mutation
//!
//! All writes go through parted in byte units so partitions land exactly
//! where the plan put them. After every write the kernel is told to reread
//! the table and given time to create the device nodes.

use crate::disk::detection::{partition_path, read_partition_table};
use crate::disk::layouts::{PartitionPlan, PlannedPartition};
use crate::utils::command::CommandRunner;
use crate::utils::error::{ProvisionError, Result};
use serde::Serialize;
use std::time::Duration;
use tracing::{info, warn};

/// Partitions created from a plan, with their resolved device nodes
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppliedPlan {
    pub efi_index: u32,
    pub root_index: u32,
    pub efi_device: String,
    pub root_device: String,
}

/// Applies partition changes to one disk
pub struct PartitionEditor<'a> {
    cmd: &'a CommandRunner,
    settle_delay: Duration,
}

impl<'a> PartitionEditor<'a> {
    pub fn new(cmd: &'a CommandRunner, settle_delay: Duration) -> Self {
        Self { cmd, settle_delay }
    }

    /// Make the kernel pick up the new table and wait for device nodes.
    ///
    /// Failures here are logged only: the table on disk is already written,
    /// and a stale kernel view surfaces as a missing partition or device
    /// node in the step that reads it back.
    fn refresh(&self, disk: &str) {
        if let Err(e) = self.cmd.run("partprobe", &[disk]) {
            warn!("partprobe {} failed: {}", disk, e);
        }
        if let Err(e) = self.cmd.run("udevadm", &["settle"]) {
            warn!("udevadm settle failed: {}", e);
        }
        if !self.settle_delay.is_zero() && !self.cmd.is_dry_run() {
            std::thread::sleep(self.settle_delay);
        }
    }

    fn parted(&self, disk: &str, args: &[&str]) -> Result<()> {
        let mut argv = vec!["-s", disk];
        argv.extend_from_slice(args);
        self.cmd
            .run("parted", &argv)
            .map(|_| ())
            .map_err(|e| ProvisionError::PartitionTableWriteFailed(format!("{}: {}", disk, e)))
    }

    /// Write an empty GPT label
    pub fn create_label(&self, disk: &str) -> Result<()> {
        info!("Writing new GPT label to {}", disk);
        self.parted(disk, &["mklabel", "gpt"])?;
        self.refresh(disk);
        Ok(())
    }

    /// Create a partition spanning `start..end` bytes and return the number
    /// the table assigned to it.
    pub fn create_partition(
        &self,
        disk: &str,
        fs_hint: &str,
        start: u64,
        end: u64,
        name: &str,
    ) -> Result<u32> {
        if end <= start {
            return Err(ProvisionError::PartitionTableWriteFailed(format!(
                "empty range {}..{} on {}",
                start, end, disk
            )));
        }

        info!("Creating partition {} on {} at {}..{}", name, disk, start, end);
        // parted takes an inclusive end
        let start_arg = format!("{}B", start);
        let end_arg = format!("{}B", end - 1);
        self.parted(
            disk,
            &["-a", "none", "unit", "B", "mkpart", name, fs_hint, &start_arg, &end_arg],
        )?;
        self.refresh(disk);

        if self.cmd.is_dry_run() {
            return Ok(0);
        }

        let table = read_partition_table(self.cmd, disk)?;
        table
            .partitions
            .iter()
            .find(|p| p.start == start)
            .map(|p| p.index)
            .ok_or_else(|| {
                ProvisionError::PartitionTableWriteFailed(format!(
                    "partition at byte {} not found on {} after creation",
                    start, disk
                ))
            })
    }

    /// Mark a partition as EFI system partition
    pub fn set_esp_flag(&self, disk: &str, index: u32) -> Result<()> {
        let number = index.to_string();
        self.parted(disk, &["set", &number, "esp", "on"])?;
        self.refresh(disk);
        Ok(())
    }

    pub fn delete_partition(&self, disk: &str, index: u32) -> Result<()> {
        info!("Deleting partition {} on {}", index, disk);
        let number = index.to_string();
        self.parted(disk, &["rm", &number])?;
        self.refresh(disk);
        Ok(())
    }

    /// Delete several partitions, highest number first so earlier deletions
    /// cannot renumber later ones.
    pub fn delete_partitions(&self, disk: &str, indices: &[u32]) -> Result<()> {
        let mut ordered = indices.to_vec();
        ordered.sort_unstable_by(|a, b| b.cmp(a));
        ordered.dedup();

        for index in ordered {
            self.delete_partition(disk, index)?;
        }
        Ok(())
    }

    /// Create the EFI and root partitions of `plan`
    pub fn apply_plan(&self, disk: &str, plan: &PartitionPlan, root_name: &str) -> Result<AppliedPlan> {
        info!("Applying partition plan to {}", disk);

        let efi_index = self.create_planned(disk, "fat32", plan.efi, "EFI")?;
        self.set_esp_flag(disk, efi_index)?;
        let root_index = self.create_planned(disk, "btrfs", plan.root, root_name)?;

        Ok(AppliedPlan {
            efi_index,
            root_index,
            efi_device: partition_path(disk, efi_index),
            root_device: partition_path(disk, root_index),
        })
    }

    fn create_planned(
        &self,
        disk: &str,
        fs_hint: &str,
        planned: PlannedPartition,
        name: &str,
    ) -> Result<u32> {
        let index = self.create_partition(disk, fs_hint, planned.start, planned.end, name)?;
        // Nothing was written in dry-run mode, so the prediction stands
        if self.cmd.is_dry_run() {
            return Ok(planned.index);
        }
        if index != planned.index {
            warn!(
                "Partition {} got number {} (expected {})",
                name, index, planned.index
            );
        }
        Ok(index)
    }
}
