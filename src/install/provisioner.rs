//! Provisioning orchestrator
//!
//! Drives one target disk from its current state to a mounted btrfs tree:
//! probe and validate, rewrite the partition table, optionally encrypt, build
//! the subvolume layout, mount everything. Nothing is written until every
//! check that can be made up front has passed. Once the first destructive
//! step has run, any failure rolls back what was mounted and opened before
//! the error is returned.

use crate::cleanup::Rollback;
use crate::config::ProvisionConfig;
use crate::configure::encryption::{luks_format, open_luks};
use crate::disk::detection::{
    disk_size, find_foreign_efi, has_partitions, list_partitions, partition_path,
    read_partition_table, PartitionEntry, PartitionTable, WINDOWS_EFI_MARKER,
};
use crate::disk::formatting::{
    create_subvolume, filesystem_type, filesystem_uuid, format_btrfs, format_efi,
};
use crate::disk::free_space::{
    fresh_gpt_segment, free_segments_after, largest_free_segment, pick_largest, total_free_bytes,
    FreeSegment,
};
use crate::disk::layouts::{plan_layout, print_plan_summary, PartitionPlan, SizingPolicy};
use crate::disk::partitioning::PartitionEditor;
use crate::disk::volumes::{default_subvolumes, mount_device, unmount_path, MountPlan};
use crate::utils::audit::AuditLog;
use crate::utils::command::CommandRunner;
use crate::utils::error::{ProvisionError, Result};
use crate::utils::prompt::warn_confirm;
use crate::utils::signal::checkpoint;
use crate::utils::units::format_size;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// What the disk looks like after the last step that completed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceState {
    Untouched,
    PartitionsDeleted,
    LabelWritten,
    Partitioned,
    EncryptedClosed,
    EncryptedOpen,
    FilesystemCreated,
    SubvolumesCreated,
    SubvolumesMounted,
    EfiMounted,
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Untouched => "disk untouched",
            Self::PartitionsDeleted => "selected partitions deleted",
            Self::LabelWritten => "empty GPT label written",
            Self::Partitioned => "EFI and root partitions created",
            Self::EncryptedClosed => "LUKS container formatted (closed)",
            Self::EncryptedOpen => "LUKS container open",
            Self::FilesystemCreated => "btrfs filesystem created",
            Self::SubvolumesCreated => "subvolumes created",
            Self::SubvolumesMounted => "subvolumes mounted",
            Self::EfiMounted => "EFI partition mounted",
        };
        f.write_str(text)
    }
}

/// Everything learned and decided before the disk is touched
#[derive(Debug, Clone, Serialize)]
pub struct PlanPreview {
    pub device: String,
    /// Current table; `None` when the disk has no label at all
    pub table: Option<PartitionTable>,
    /// Partitions that will be deleted first
    pub deletions: Vec<PartitionEntry>,
    /// A new GPT label is written because the disk holds no partitions
    pub fresh_label: bool,
    /// Free segments once deletions are done
    pub segments: Vec<FreeSegment>,
    pub policy: SizingPolicy,
    pub plan: PartitionPlan,
    pub encrypted: bool,
    /// FAT volume carrying another OS's boot files
    pub foreign_efi: Option<String>,
}

impl PlanPreview {
    pub fn print(&self) {
        println!("\nTarget disk: {}", self.device);
        match &self.table {
            Some(table) if !table.partitions.is_empty() => {
                println!(
                    "Current {} table ({}):",
                    table.label,
                    format_size(table.size_bytes)
                );
                for p in &table.partitions {
                    let marker = if self.deletions.contains(p) { "delete" } else { "keep" };
                    println!(
                        "  #{:<3} {:>10} {:<8} {:<24} [{}]",
                        p.index,
                        format_size(p.size),
                        p.filesystem,
                        p.name,
                        marker
                    );
                }
            }
            _ => println!("No partitions: a new GPT label will be written"),
        }

        if let Some(efi) = &self.foreign_efi {
            println!("Another OS boots from {} (left untouched)", efi);
        }
        println!(
            "Free space: {} in {} segment(s)",
            format_size(total_free_bytes(&self.segments)),
            self.segments.len()
        );
        println!("Sizing: {}", self.policy);
        println!(
            "Encryption: {}",
            if self.encrypted { "LUKS2" } else { "none" }
        );
        print_plan_summary(&self.device, &self.plan);
    }
}

/// Result of a completed run: a mounted tree ready for installation
#[derive(Debug, Clone, Serialize)]
pub struct ProvisionedStorage {
    pub device: String,
    pub mount_root: PathBuf,
    pub efi_device: String,
    /// Raw root partition
    pub root_partition: String,
    /// Device holding the filesystem (the mapper device when encrypted)
    pub root_device: String,
    pub root_fs_uuid: String,
    pub luks_uuid: Option<String>,
    pub mapper_name: Option<String>,
    pub subvolumes: Vec<String>,
    pub foreign_efi: Option<String>,
    pub audit: AuditLog,
}

impl ProvisionedStorage {
    pub fn print(&self) {
        println!("\nStorage ready under {}", self.mount_root.display());
        println!("  EFI:            {}", self.efi_device);
        println!("  Root partition: {}", self.root_partition);
        println!("  Root device:    {}", self.root_device);
        println!("  Root fs UUID:   {}", self.root_fs_uuid);
        if let Some(uuid) = &self.luks_uuid {
            println!("  LUKS UUID:      {}", uuid);
        }
        println!("  Subvolumes:     {}", self.subvolumes.join(" "));
    }
}

/// Step bookkeeping for one run
struct Progress {
    step: &'static str,
    state: DeviceState,
    rollback: Rollback,
    bar: ProgressBar,
}

impl Progress {
    fn new() -> Self {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::with_template("{spinner:.green} [{pos}] {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        Self {
            step: "probe",
            state: DeviceState::Untouched,
            rollback: Rollback::new(),
            bar,
        }
    }

    /// Pause point: honour an abort request, then enter `step`
    fn begin(&mut self, step: &'static str) -> Result<()> {
        self.step = step;
        checkpoint(step)?;
        info!("Step: {}", step);
        self.bar.inc(1);
        self.bar.set_message(step);
        Ok(())
    }

    fn reached(&mut self, state: DeviceState) {
        info!("State: {}", state);
        self.state = state;
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }

    fn into_error(self, source: ProvisionError) -> ProvisionError {
        self.bar.abandon_with_message(format!("{} failed", self.step));
        ProvisionError::StepFailed {
            step: self.step.to_string(),
            last_good: self.state.to_string(),
            source: Box::new(source),
        }
    }
}

/// Provisions one disk according to a [`ProvisionConfig`]
pub struct Provisioner {
    config: ProvisionConfig,
    cmd: CommandRunner,
    /// Skip interactive confirmation prompt
    skip_confirm: bool,
}

impl Provisioner {
    pub fn new(config: ProvisionConfig, cmd: CommandRunner) -> Self {
        Self {
            config,
            cmd,
            skip_confirm: false,
        }
    }

    /// Skip the interactive confirmation prompt.
    /// Use this when confirmation has already been obtained.
    pub fn with_skip_confirm(mut self, skip: bool) -> Self {
        self.skip_confirm = skip;
        self
    }

    pub fn config(&self) -> &ProvisionConfig {
        &self.config
    }

    /// Destructive commands issued so far
    pub fn audit_log(&self) -> AuditLog {
        self.cmd.audit_log()
    }

    fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.config.mount.settle_delay_ms)
    }

    /// Probe the disk and compute the plan without changing anything.
    ///
    /// Fails on every problem that can be detected up front: bad settings,
    /// unknown or protected partitions in the deletion list, not enough
    /// space for the sizing policy.
    pub fn preview(&self) -> Result<PlanPreview> {
        let device = self.config.disk.device.as_str();
        self.config.validate_settings()?;
        let policy = self.config.sizing_policy()?;

        let partitioned = has_partitions(&self.cmd, device)?;
        let table = if partitioned {
            Some(read_partition_table(&self.cmd, device)?)
        } else {
            read_partition_table(&self.cmd, device).ok()
        };
        // Partitions are named and flagged the GPT way; other labels are only
        // replaced when nothing is left on them
        if let Some(table) = table.as_ref().filter(|_| partitioned) {
            if table.label != "gpt" {
                return Err(ProvisionError::ValidationError(format!(
                    "{} has a {} partition table; only GPT disks can be shared",
                    device, table.label
                )));
            }
        }

        let foreign_efi = match find_foreign_efi(&self.cmd, WINDOWS_EFI_MARKER) {
            Ok(found) => found,
            Err(e) => {
                warn!("{}; assuming no other OS is installed", e);
                None
            }
        };

        let existing: &[PartitionEntry] = table
            .as_ref()
            .map(|t| t.partitions.as_slice())
            .unwrap_or(&[]);
        let deletions = select_deletions(
            device,
            existing,
            &self.config.disk.delete_partitions,
            foreign_efi.as_deref(),
        )?;

        let segments = if partitioned {
            let released: Vec<(u64, u64)> = deletions.iter().map(|p| (p.start, p.end)).collect();
            free_segments_after(&self.cmd, device, &released)?
        } else {
            let segment = fresh_gpt_segment(disk_size(&self.cmd, device)?);
            if segment.is_empty() {
                Vec::new()
            } else {
                vec![segment]
            }
        };

        let taken: Vec<u32> = existing
            .iter()
            .filter(|p| !deletions.contains(p))
            .map(|p| p.index)
            .collect();
        let segment = pick_largest(&segments);
        let plan = plan_layout(&segment, &policy, &taken)?;

        Ok(PlanPreview {
            device: device.to_string(),
            table,
            deletions,
            fresh_label: !partitioned,
            segments,
            policy,
            plan,
            encrypted: self.config.encryption.enabled,
            foreign_efi,
        })
    }

    /// Dry run: probe and plan, then log the partition table commands a
    /// real run would issue. Requires a dry-run [`CommandRunner`].
    pub fn rehearse(&self) -> Result<PlanPreview> {
        if !self.cmd.is_dry_run() {
            return Err(ProvisionError::ValidationError(
                "rehearsal needs a dry-run command runner".to_string(),
            ));
        }

        let preview = self.preview()?;
        preview.print();

        let device = preview.device.as_str();
        let editor = PartitionEditor::new(&self.cmd, Duration::ZERO);
        let indices: Vec<u32> = preview.deletions.iter().map(|p| p.index).collect();
        editor.delete_partitions(device, &indices)?;
        if preview.fresh_label {
            editor.create_label(device)?;
        }
        editor.apply_plan(device, &preview.plan, &self.config.layout.filesystem_label)?;

        println!("\nDry run: no changes were made. Formatting and mounting follow on a real run.");
        Ok(preview)
    }

    /// Run the whole pipeline
    pub fn run(&self) -> Result<ProvisionedStorage> {
        if self.cmd.is_dry_run() {
            return Err(ProvisionError::ValidationError(
                "dry runs go through rehearse()".to_string(),
            ));
        }

        let device = self.config.disk.device.clone();
        info!("Starting provisioning of {}", device);

        // Phase 1: everything that can fail before the disk is touched
        info!("[Phase 1/5] Probing {} and validating the plan", device);
        let preview = self.preview()?;
        preview.print();
        let passphrase = self.passphrase()?;

        let warning = if preview.fresh_label {
            format!(
                "This will write a NEW PARTITION TABLE to {}. This operation cannot be undone!",
                device
            )
        } else if !preview.deletions.is_empty() {
            format!(
                "This will DELETE {} partition(s) on {}. This operation cannot be undone!",
                preview.deletions.len(),
                device
            )
        } else {
            format!(
                "New partitions will be created in free space on {}. Existing partitions are kept.",
                device
            )
        };
        if !self.skip_confirm && !warn_confirm(&warning)? {
            return Err(ProvisionError::UserCancelled);
        }

        let mut progress = Progress::new();
        match self.provision(&preview, passphrase.as_deref(), &mut progress) {
            Ok(storage) => {
                progress.finish();
                info!("Provisioning of {} finished successfully", device);
                Ok(storage)
            }
            Err(e) => {
                warn!("Step '{}' failed: {}", progress.step, e);
                progress.rollback.rollback(&self.cmd);
                Err(progress.into_error(e))
            }
        }
    }

    fn passphrase(&self) -> Result<Option<String>> {
        if !self.config.encryption.enabled {
            return Ok(None);
        }
        match &self.config.encryption.passphrase {
            Some(p) if !p.is_empty() => Ok(Some(p.clone())),
            _ => Err(ProvisionError::ValidationError(
                "encryption is enabled but no passphrase was supplied".to_string(),
            )),
        }
    }

    fn provision(
        &self,
        preview: &PlanPreview,
        passphrase: Option<&str>,
        progress: &mut Progress,
    ) -> Result<ProvisionedStorage> {
        let device = preview.device.as_str();
        let label = self.config.layout.filesystem_label.as_str();
        let editor = PartitionEditor::new(&self.cmd, self.settle_delay());

        // Phase 2: partition table
        info!("[Phase 2/5] Partitioning {}", device);
        if !preview.deletions.is_empty() {
            progress.begin("delete partitions")?;
            let indices: Vec<u32> = preview.deletions.iter().map(|p| p.index).collect();
            editor.delete_partitions(device, &indices)?;
            progress.reached(DeviceState::PartitionsDeleted);
        }
        if preview.fresh_label {
            progress.begin("write partition label")?;
            editor.create_label(device)?;
            progress.reached(DeviceState::LabelWritten);
        }

        // The table changed, so the plan is derived again from what is there now
        progress.begin("plan layout")?;
        let segment = largest_free_segment(&self.cmd, device)?;
        let taken: Vec<u32> = list_partitions(&self.cmd, device)?
            .iter()
            .map(|p| p.index)
            .collect();
        let plan = plan_layout(&segment, &preview.policy, &taken)?;
        if plan != preview.plan {
            return Err(ProvisionError::ValidationError(format!(
                "free space on {} changed since the plan was shown (now {}); nothing was created",
                device, segment
            )));
        }

        progress.begin("create partitions")?;
        let applied = editor.apply_plan(device, &plan, label)?;
        progress.reached(DeviceState::Partitioned);

        // Phase 3: encryption
        info!("[Phase 3/5] Encryption");
        let mapper_name = self.config.encryption.mapper_name.as_str();
        let (fs_device, luks_uuid) = match passphrase {
            Some(passphrase) => {
                progress.begin("format LUKS container")?;
                luks_format(&self.cmd, &applied.root_device, passphrase)?;
                progress.reached(DeviceState::EncryptedClosed);

                progress.begin("open LUKS container")?;
                let container = open_luks(&self.cmd, &applied.root_device, mapper_name, passphrase)?;
                progress.rollback.track_container(&container.mapper_name);
                progress.reached(DeviceState::EncryptedOpen);
                (container.mapped_path, Some(container.luks_uuid))
            }
            None => {
                info!("Encryption disabled; using {} directly", applied.root_device);
                (applied.root_device.clone(), None)
            }
        };

        // Phase 4: filesystem and subvolumes
        info!("[Phase 4/5] Building btrfs on {}", fs_device);
        progress.begin("create filesystem")?;
        format_btrfs(&self.cmd, &fs_device, label)?;
        progress.reached(DeviceState::FilesystemCreated);

        let root = PathBuf::from(&self.config.mount.root);
        let subvolumes = default_subvolumes();

        progress.begin("create subvolumes")?;
        self.mount_tracked(progress, &fs_device, &root, None)?;
        for sv in &subvolumes {
            create_subvolume(&self.cmd, &root.join(&sv.name))?;
        }
        unmount_path(&self.cmd, &root)?;
        progress.rollback.untrack_mount(&root.to_string_lossy());
        progress.reached(DeviceState::SubvolumesCreated);

        progress.begin("mount subvolumes")?;
        let mounts = MountPlan::new(&root, &subvolumes);
        for entry in mounts.mount_order() {
            self.mount_tracked(progress, &fs_device, &entry.target, Some(&entry.options))?;
        }
        progress.reached(DeviceState::SubvolumesMounted);

        // Phase 5: EFI partition and identifiers
        info!("[Phase 5/5] EFI partition {}", applied.efi_device);
        progress.begin("prepare EFI partition")?;
        if self.config.layout.format_efi {
            format_efi(&self.cmd, &applied.efi_device)?;
        } else {
            match filesystem_type(&self.cmd, &applied.efi_device) {
                Some(kind) if kind == "vfat" => {
                    info!("Keeping existing FAT filesystem on {}", applied.efi_device)
                }
                other => {
                    return Err(ProvisionError::FormatFailed(format!(
                        "{} holds {} instead of FAT and formatting was declined",
                        applied.efi_device,
                        other.as_deref().unwrap_or("no filesystem")
                    )))
                }
            }
        }

        progress.begin("mount EFI partition")?;
        self.mount_tracked(progress, &applied.efi_device, &root.join("boot"), None)?;
        progress.reached(DeviceState::EfiMounted);

        progress.begin("read filesystem identifiers")?;
        let root_fs_uuid = filesystem_uuid(&self.cmd, &fs_device)?;

        let storage = ProvisionedStorage {
            device: device.to_string(),
            mount_root: root,
            efi_device: applied.efi_device,
            root_partition: applied.root_device,
            root_device: fs_device,
            root_fs_uuid,
            mapper_name: luks_uuid.as_ref().map(|_| mapper_name.to_string()),
            luks_uuid,
            subvolumes: subvolumes.into_iter().map(|sv| sv.name).collect(),
            foreign_efi: preview.foreign_efi.clone(),
            audit: self.cmd.audit_log(),
        };
        Ok(storage)
    }

    fn mount_tracked(
        &self,
        progress: &mut Progress,
        device: &str,
        target: &Path,
        options: Option<&str>,
    ) -> Result<()> {
        mount_device(&self.cmd, device, target, options)?;
        progress.rollback.track_mount(&target.to_string_lossy());
        Ok(())
    }
}

/// Resolve the partitions to delete. Unknown numbers and the partition
/// holding another OS's boot files are rejected.
fn select_deletions(
    device: &str,
    existing: &[PartitionEntry],
    requested: &[u32],
    foreign_efi: Option<&str>,
) -> Result<Vec<PartitionEntry>> {
    let mut deletions: Vec<PartitionEntry> = Vec::new();

    for &index in requested {
        let entry = existing.iter().find(|p| p.index == index).ok_or_else(|| {
            ProvisionError::ValidationError(format!("{} has no partition {}", device, index))
        })?;

        if foreign_efi == Some(partition_path(device, index).as_str()) {
            return Err(ProvisionError::ValidationError(format!(
                "partition {} holds another operating system's boot files",
                partition_path(device, index)
            )));
        }

        if !deletions.contains(entry) {
            deletions.push(entry.clone());
        }
    }

    Ok(deletions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::mock::MockDisk;
    use crate::utils::units::{GIB, MIB};

    fn entry(index: u32, start: u64, end: u64) -> PartitionEntry {
        PartitionEntry {
            index,
            start,
            end,
            size: end - start,
            filesystem: String::new(),
            name: String::new(),
            flags: Vec::new(),
        }
    }

    #[test]
    fn deletions_are_validated_and_deduplicated() {
        let existing = [entry(1, 1, 2), entry(2, 2, 3), entry(3, 3, 4)];

        let picked = select_deletions("/dev/sda", &existing, &[3, 2, 3], None).unwrap();
        let indices: Vec<u32> = picked.iter().map(|p| p.index).collect();
        assert_eq!(indices, vec![3, 2]);

        assert!(matches!(
            select_deletions("/dev/sda", &existing, &[7], None),
            Err(ProvisionError::ValidationError(_))
        ));
    }

    #[test]
    fn foreign_boot_partition_is_protected() {
        let existing = [entry(1, 1, 2), entry(2, 2, 3)];
        assert!(matches!(
            select_deletions("/dev/nvme0n1", &existing, &[1], Some("/dev/nvme0n1p1")),
            Err(ProvisionError::ValidationError(_))
        ));
        assert!(select_deletions("/dev/nvme0n1", &existing, &[2], Some("/dev/nvme0n1p1")).is_ok());
    }

    #[test]
    fn step_errors_carry_the_last_good_state() {
        let mut progress = Progress::new();
        progress.begin("create filesystem").unwrap();
        progress.reached(DeviceState::EncryptedOpen);

        let err = progress.into_error(ProvisionError::FormatFailed("boom".to_string()));
        match &err {
            ProvisionError::StepFailed {
                step, last_good, ..
            } => {
                assert_eq!(step, "create filesystem");
                assert_eq!(last_good, "LUKS container open");
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert!(matches!(err.kind(), ProvisionError::FormatFailed(_)));
    }

    #[test]
    fn plan_that_no_longer_matches_the_disk_creates_nothing() {
        let disk = MockDisk::empty("/dev/sda", 20 * GIB);
        let mut config = ProvisionConfig::for_device("/dev/sda");
        config.mount.settle_delay_ms = 0;
        let provisioner = Provisioner::new(config, disk.runner()).with_skip_confirm(true);

        let mut preview = provisioner.preview().unwrap();
        preview.plan.root.end -= MIB;

        let err = provisioner
            .provision(&preview, None, &mut Progress::new())
            .unwrap_err();
        assert!(matches!(err, ProvisionError::ValidationError(_)));
        assert!(disk.partitions().is_empty());
        assert!(!provisioner
            .audit_log()
            .entries()
            .iter()
            .any(|e| e.command.contains("mkpart")));
    }
}
