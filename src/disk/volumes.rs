//! Btrfs subvolume layout and the mount tree built from it.

use crate::utils::command::CommandRunner;
use crate::utils::error::{ProvisionError, Result};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

/// Mount options shared by every subvolume mount
pub const SUBVOLUME_MOUNT_OPTIONS: &str = "noatime,compress=zstd";

/// Btrfs subvolume definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubvolumeDef {
    /// Subvolume name (e.g., "@", "@home")
    pub name: String,
    /// Mount path relative to the tree root ("" for the root itself);
    /// `None` for subvolumes created but left unmounted
    pub mount_point: Option<String>,
}

impl SubvolumeDef {
    fn new(name: &str, mount_point: Option<&str>) -> Self {
        Self {
            name: name.to_string(),
            mount_point: mount_point.map(str::to_string),
        }
    }
}

/// The fixed subvolume set: root, home, snapshots, log and a swap reserve.
/// `@swap` is created but mounted later by whoever sets up swap.
pub fn default_subvolumes() -> Vec<SubvolumeDef> {
    vec![
        SubvolumeDef::new("@", Some("")),
        SubvolumeDef::new("@home", Some("home")),
        SubvolumeDef::new("@snapshots", Some(".snapshots")),
        SubvolumeDef::new("@log", Some("var/log")),
        SubvolumeDef::new("@swap", None),
    ]
}

/// One subvolume mount
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MountEntry {
    pub subvolume: String,
    /// Absolute mount target
    pub target: PathBuf,
    /// Full option string including `subvol=`
    pub options: String,
}

/// Subvolume mounts under one tree root, in dependency order
#[derive(Debug, Clone, Serialize)]
pub struct MountPlan {
    entries: Vec<MountEntry>,
}

impl MountPlan {
    pub fn new(root: &Path, subvolumes: &[SubvolumeDef]) -> Self {
        let mut entries: Vec<(usize, MountEntry)> = subvolumes
            .iter()
            .filter_map(|sv| {
                let rel = sv.mount_point.as_deref()?;
                let rel = rel.trim_matches('/');
                let target = if rel.is_empty() {
                    root.to_path_buf()
                } else {
                    root.join(rel)
                };
                let depth = if rel.is_empty() {
                    0
                } else {
                    rel.split('/').count()
                };
                Some((
                    depth,
                    MountEntry {
                        subvolume: sv.name.clone(),
                        target,
                        options: format!("{},subvol={}", SUBVOLUME_MOUNT_OPTIONS, sv.name),
                    },
                ))
            })
            .collect();

        // Stable sort keeps declaration order among equal depths
        entries.sort_by_key(|(depth, _)| *depth);
        Self {
            entries: entries.into_iter().map(|(_, e)| e).collect(),
        }
    }

    /// Parents before children
    pub fn mount_order(&self) -> impl Iterator<Item = &MountEntry> {
        self.entries.iter()
    }

    /// Children before parents
    pub fn unmount_order(&self) -> impl Iterator<Item = &MountEntry> {
        self.entries.iter().rev()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Mount `device` at `target`, creating the directory if needed
pub fn mount_device(
    cmd: &CommandRunner,
    device: &str,
    target: &Path,
    options: Option<&str>,
) -> Result<()> {
    if !cmd.is_dry_run() {
        fs::create_dir_all(target)?;
    }

    let target_str = target.to_string_lossy();
    info!("Mounting {} at {}", device, target_str);
    let mut args = Vec::new();
    if let Some(opts) = options {
        args.extend(["-o", opts]);
    }
    args.extend([device, target_str.as_ref()]);

    cmd.run("mount", &args)
        .map(|_| ())
        .map_err(|e| ProvisionError::MountFailed(format!("{} at {}: {}", device, target_str, e)))
}

pub fn unmount_path(cmd: &CommandRunner, target: &Path) -> Result<()> {
    let target_str = target.to_string_lossy();
    cmd.run("umount", &[target_str.as_ref()])
        .map(|_| ())
        .map_err(|e| ProvisionError::MountFailed(format!("unmount {}: {}", target_str, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn five_subvolumes_four_mounted() {
        let subvolumes = default_subvolumes();
        assert_eq!(subvolumes.len(), 5);

        let plan = MountPlan::new(Path::new("/mnt"), &subvolumes);
        assert_eq!(plan.len(), 4);
        assert!(plan.mount_order().all(|e| e.subvolume != "@swap"));
    }

    #[test]
    fn root_mounts_first_and_unmounts_last() {
        let plan = MountPlan::new(Path::new("/mnt"), &default_subvolumes());

        let targets: Vec<PathBuf> = plan.mount_order().map(|e| e.target.clone()).collect();
        assert_eq!(
            targets,
            vec![
                PathBuf::from("/mnt"),
                PathBuf::from("/mnt/home"),
                PathBuf::from("/mnt/.snapshots"),
                PathBuf::from("/mnt/var/log"),
            ]
        );

        let last = plan.unmount_order().last().unwrap();
        assert_eq!(last.subvolume, "@");
    }

    #[test]
    fn nested_paths_follow_parents_regardless_of_declaration() {
        let subvolumes = vec![
            SubvolumeDef::new("@log", Some("var/log")),
            SubvolumeDef::new("@", Some("")),
        ];
        let plan = MountPlan::new(Path::new("/target"), &subvolumes);
        let first = plan.mount_order().next().unwrap();
        assert_eq!(first.subvolume, "@");
        assert_eq!(first.options, "noatime,compress=zstd,subvol=@");
    }
}
