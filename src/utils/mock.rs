//! In-memory disk for exercising the engine without block devices.
//!
//! [`MockDisk`] implements [`CommandExecutor`] and answers the subset of
//! parted, lsblk, cryptsetup, mkfs, btrfs, blkid, mount and umount that the
//! engine drives, keeping a consistent partition table, filesystem map,
//! device-mapper table and mount table. Mount targets must exist on the real
//! filesystem, so tests point the tree root at a temporary directory.

use crate::disk::detection::partition_path;
use crate::utils::command::{CommandExecutor, CommandOutput, CommandRunner};
use crate::utils::error::Result;
use serde_json::json;
use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use uuid::Uuid;

const SECTOR: u64 = 512;
/// Protective MBR + GPT header + 32 sectors of entries
const GPT_HEAD: u64 = 34 * SECTOR;
/// Backup entries + backup header
const GPT_TAIL: u64 = 33 * SECTOR;

#[derive(Debug, Clone)]
struct MockPartition {
    index: u32,
    start: u64,
    /// exclusive
    end: u64,
    name: String,
    flags: Vec<String>,
}

#[derive(Debug, Clone)]
struct Filesystem {
    kind: String,
    uuid: String,
}

#[derive(Debug, Clone)]
struct MountRecord {
    source: String,
    target: String,
    options: String,
}

#[derive(Debug)]
struct State {
    device: String,
    size: u64,
    label: Option<String>,
    partitions: Vec<MockPartition>,
    /// Devices outside the target disk: (path, fstype)
    foreign: Vec<(String, String)>,
    /// FAT volumes holding a Windows boot manager
    windows_boot: Vec<String>,
    filesystems: HashMap<String, Filesystem>,
    luks_keys: HashMap<String, Vec<u8>>,
    mappings: Vec<(String, String)>,
    mounts: Vec<MountRecord>,
    subvolumes: Vec<String>,
    failures: Vec<(String, String)>,
    history: Vec<String>,
}

/// Simulated target disk plus the rest of the machine's storage
#[derive(Debug, Clone)]
pub struct MockDisk {
    state: Rc<RefCell<State>>,
}

fn reply(ok: bool, stdout: impl Into<String>, stderr: &str) -> CommandOutput {
    if ok {
        CommandOutput::ok(stdout)
    } else {
        CommandOutput::failed(1, stderr)
    }
}

fn parse_bytes(arg: &str) -> Option<u64> {
    arg.trim_end_matches('B').parse().ok()
}

impl MockDisk {
    fn with_label(device: &str, size: u64, label: Option<&str>) -> Self {
        Self {
            state: Rc::new(RefCell::new(State {
                device: device.to_string(),
                size,
                label: label.map(str::to_string),
                partitions: Vec::new(),
                foreign: Vec::new(),
                windows_boot: Vec::new(),
                filesystems: HashMap::new(),
                luks_keys: HashMap::new(),
                mappings: Vec::new(),
                mounts: Vec::new(),
                subvolumes: Vec::new(),
                failures: Vec::new(),
                history: Vec::new(),
            })),
        }
    }

    /// A disk with an empty GPT label
    pub fn empty(device: &str, size: u64) -> Self {
        Self::with_label(device, size, Some("gpt"))
    }

    /// A disk carrying a `label` table (`gpt`, `msdos`, ...)
    pub fn labeled(device: &str, size: u64, label: &str) -> Self {
        Self::with_label(device, size, Some(label))
    }

    /// A factory-fresh disk without any partition table
    pub fn unlabeled(device: &str, size: u64) -> Self {
        Self::with_label(device, size, None)
    }

    /// Add an existing partition `start..end` (bytes) with a filesystem
    pub fn with_partition(self, start: u64, end: u64, fs: &str, name: &str, flags: &[&str]) -> Self {
        {
            let mut st = self.state.borrow_mut();
            let index = (1u32..)
                .find(|n| !st.partitions.iter().any(|p| p.index == *n))
                .unwrap_or(1);
            st.partitions.push(MockPartition {
                index,
                start,
                end,
                name: name.to_string(),
                flags: flags.iter().map(|f| f.to_string()).collect(),
            });
            if !fs.is_empty() {
                let path = partition_path(&st.device, index);
                st.filesystems.insert(
                    path,
                    Filesystem {
                        kind: fs.to_string(),
                        uuid: Uuid::new_v4().to_string(),
                    },
                );
            }
        }
        self
    }

    /// Add a volume on another disk, optionally carrying Windows boot files
    pub fn with_foreign_volume(self, path: &str, fstype: &str, windows_boot: bool) -> Self {
        {
            let mut st = self.state.borrow_mut();
            st.foreign.push((path.to_string(), fstype.to_string()));
            if windows_boot {
                st.windows_boot.push(path.to_string());
            }
        }
        self
    }

    /// Put a Windows boot manager on `device` (mounts show `EFI/Microsoft`)
    pub fn with_windows_boot_files(self, device: &str) -> Self {
        self.state.borrow_mut().windows_boot.push(device.to_string());
        self
    }

    /// Make every `program` invocation whose arguments contain `needle` fail
    pub fn fail_on(&self, program: &str, needle: &str) {
        self.state
            .borrow_mut()
            .failures
            .push((program.to_string(), needle.to_string()));
    }

    /// A runner executing against this disk
    pub fn runner(&self) -> CommandRunner {
        CommandRunner::with_executor(self.clone(), false)
    }

    pub fn device(&self) -> String {
        self.state.borrow().device.clone()
    }

    /// Current partitions as (index, start, end), ordered by start
    pub fn partitions(&self) -> Vec<(u32, u64, u64)> {
        let st = self.state.borrow();
        let mut parts: Vec<_> = st.partitions.iter().map(|p| (p.index, p.start, p.end)).collect();
        parts.sort_by_key(|p| p.1);
        parts
    }

    pub fn has_flag(&self, index: u32, flag: &str) -> bool {
        self.state
            .borrow()
            .partitions
            .iter()
            .any(|p| p.index == index && p.flags.iter().any(|f| f == flag))
    }

    pub fn filesystem(&self, device: &str) -> Option<String> {
        self.state
            .borrow()
            .filesystems
            .get(device)
            .map(|f| f.kind.clone())
    }

    /// Active mounts as (source, target), in mount order
    pub fn mounts(&self) -> Vec<(String, String)> {
        self.state
            .borrow()
            .mounts
            .iter()
            .map(|m| (m.source.clone(), m.target.clone()))
            .collect()
    }

    pub fn mount_options(&self, target: &str) -> Option<String> {
        self.state
            .borrow()
            .mounts
            .iter()
            .find(|m| m.target == target)
            .map(|m| m.options.clone())
    }

    pub fn open_mappings(&self) -> Vec<String> {
        self.state
            .borrow()
            .mappings
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn subvolumes(&self) -> Vec<String> {
        self.state.borrow().subvolumes.clone()
    }

    /// Every command line executed so far, queries included
    pub fn history(&self) -> Vec<String> {
        self.state.borrow().history.clone()
    }

    pub fn force_mount(&self, source: &str, target: &str) {
        self.state.borrow_mut().mounts.push(MountRecord {
            source: source.to_string(),
            target: target.to_string(),
            options: String::new(),
        });
    }

    pub fn force_open_mapping(&self, name: &str) {
        self.state
            .borrow_mut()
            .mappings
            .push((name.to_string(), String::new()));
    }
}

impl State {
    fn usable(&self) -> (u64, u64) {
        (GPT_HEAD, self.size - GPT_TAIL)
    }

    fn device_exists(&self, path: &str) -> bool {
        path == self.device
            || self
                .partitions
                .iter()
                .any(|p| partition_path(&self.device, p.index) == path)
            || self
                .mappings
                .iter()
                .any(|(name, _)| format!("/dev/mapper/{}", name) == path)
            || self.foreign.iter().any(|(p, _)| p == path)
    }

    fn fs_kind(&self, path: &str) -> Option<String> {
        if let Some((_, fstype)) = self.foreign.iter().find(|(p, _)| p == path) {
            return Some(fstype.clone());
        }
        self.filesystems.get(path).map(|f| f.kind.clone())
    }

    fn sorted_partitions(&self) -> Vec<MockPartition> {
        let mut parts = self.partitions.clone();
        parts.sort_by_key(|p| p.start);
        parts
    }

    fn parted(&mut self, args: &[&str]) -> CommandOutput {
        let machine = args.contains(&"-m");
        let mut rest = Vec::new();
        let mut iter = args.iter().copied();
        while let Some(arg) = iter.next() {
            match arg {
                "-m" | "-s" => {}
                "-a" | "unit" => {
                    iter.next();
                }
                a if a == self.device => {}
                a => rest.push(a),
            }
        }

        match rest.as_slice() {
            ["print"] | ["print", "free"] => {
                if !machine {
                    return CommandOutput::failed(1, "mock only speaks machine mode");
                }
                self.print(rest.len() == 2)
            }
            ["mklabel", label] => {
                self.label = Some(label.to_string());
                self.partitions.clear();
                CommandOutput::ok("")
            }
            ["mkpart", name, _fs, start, end] => self.mkpart(name, start, end),
            ["set", index, flag, "on"] => {
                let Ok(index) = index.parse::<u32>() else {
                    return CommandOutput::failed(1, "bad number");
                };
                match self.partitions.iter_mut().find(|p| p.index == index) {
                    Some(p) => {
                        if *flag == "esp" && !p.flags.iter().any(|f| f == "boot") {
                            p.flags.push("boot".to_string());
                        }
                        p.flags.push(flag.to_string());
                        CommandOutput::ok("")
                    }
                    None => CommandOutput::failed(1, "Error: Partition doesn't exist."),
                }
            }
            ["rm", index] => {
                let Ok(index) = index.parse::<u32>() else {
                    return CommandOutput::failed(1, "bad number");
                };
                let before = self.partitions.len();
                self.partitions.retain(|p| p.index != index);
                let path = partition_path(&self.device, index);
                self.filesystems.remove(&path);
                reply(
                    self.partitions.len() < before,
                    "",
                    "Error: Partition doesn't exist.",
                )
            }
            _ => CommandOutput::failed(1, "unsupported parted invocation"),
        }
    }

    fn print(&self, with_free: bool) -> CommandOutput {
        let Some(label) = &self.label else {
            return CommandOutput::failed(
                1,
                &format!("Error: {}: unrecognised disk label", self.device),
            );
        };

        let mut out = format!(
            "BYT;\n{}:{}B:scsi:512:512:{}:Mock Disk:;\n",
            self.device, self.size, label
        );
        let (usable_start, usable_end) = self.usable();
        let free_line = |start: u64, end: u64| format!("1:{}B:{}B:{}B:free;\n", start, end - 1, end - start);

        let mut cursor = usable_start;
        for p in self.sorted_partitions() {
            if with_free && p.start > cursor {
                out.push_str(&free_line(cursor, p.start));
            }
            let fs = self
                .fs_kind(&partition_path(&self.device, p.index))
                .map(|k| if k == "vfat" { "fat32".to_string() } else { k })
                .filter(|k| k != "crypto_LUKS")
                .unwrap_or_default();
            out.push_str(&format!(
                "{}:{}B:{}B:{}B:{}:{}:{};\n",
                p.index,
                p.start,
                p.end - 1,
                p.end - p.start,
                fs,
                p.name,
                p.flags.join(", ")
            ));
            cursor = cursor.max(p.end);
        }
        if with_free && cursor < usable_end {
            out.push_str(&free_line(cursor, usable_end));
        }

        CommandOutput::ok(out)
    }

    fn mkpart(&mut self, name: &str, start: &str, end: &str) -> CommandOutput {
        if self.label.is_none() {
            return CommandOutput::failed(1, "Error: unrecognised disk label");
        }
        let (Some(start), Some(last)) = (parse_bytes(start), parse_bytes(end)) else {
            return CommandOutput::failed(1, "Error: invalid offset");
        };
        let end = last + 1;
        let (usable_start, usable_end) = self.usable();

        if start % SECTOR != 0 || end % SECTOR != 0 || end <= start {
            return CommandOutput::failed(1, "Error: unaligned or empty partition");
        }
        if start < usable_start || end > usable_end {
            return CommandOutput::failed(1, "Error: The location is outside of the device.");
        }
        if self
            .partitions
            .iter()
            .any(|p| start < p.end && p.start < end)
        {
            return CommandOutput::failed(1, "Error: Can't have overlapping partitions.");
        }

        let index = (1u32..)
            .find(|n| !self.partitions.iter().any(|p| p.index == *n))
            .unwrap_or(1);
        self.partitions.push(MockPartition {
            index,
            start,
            end,
            name: name.to_string(),
            flags: Vec::new(),
        });
        CommandOutput::ok("")
    }

    fn lsblk(&self, args: &[&str]) -> CommandOutput {
        let target = args.iter().find(|a| a.starts_with("/dev/")).copied();

        let name_of = |path: &str| path.trim_start_matches("/dev/").to_string();
        let node = |path: &str, kind: &str, size: Option<u64>, children: Vec<serde_json::Value>| {
            json!({
                "name": name_of(path),
                "path": path,
                "type": kind,
                "fstype": self.fs_kind(path),
                "size": size,
                "children": children,
            })
        };

        let children = self
            .sorted_partitions()
            .iter()
            .map(|p| {
                let path = partition_path(&self.device, p.index);
                node(&path, "part", Some(p.end - p.start), Vec::new())
            })
            .collect();
        let mut devices = vec![node(&self.device, "disk", Some(self.size), children)];
        for (path, _) in &self.foreign {
            devices.push(node(path, "part", Some(512 * 1024 * 1024), Vec::new()));
        }

        let devices: Vec<serde_json::Value> = match target {
            None => devices,
            Some(t) => devices.into_iter().filter(|d| d["path"] == t).collect(),
        };
        if devices.is_empty() {
            return CommandOutput::failed(32, "lsblk: not a block device");
        }

        CommandOutput::ok(json!({ "blockdevices": devices }).to_string())
    }

    fn cryptsetup(&mut self, args: &[&str], stdin: Option<&[u8]>) -> CommandOutput {
        let positional: Vec<&str> = args
            .iter()
            .copied()
            .filter(|a| !a.starts_with("--") && *a != "luks2")
            .collect();

        match positional.as_slice() {
            ["luksFormat", device] => {
                let Some(key) = stdin.filter(|k| !k.is_empty()) else {
                    return CommandOutput::failed(1, "No passphrase supplied");
                };
                if !self.device_exists(device) {
                    return CommandOutput::failed(4, "Device does not exist");
                }
                self.luks_keys.insert(device.to_string(), key.to_vec());
                self.filesystems.insert(
                    device.to_string(),
                    Filesystem {
                        kind: "crypto_LUKS".to_string(),
                        uuid: Uuid::new_v4().to_string(),
                    },
                );
                CommandOutput::ok("")
            }
            ["open", device, name] => {
                match self.luks_keys.get(*device) {
                    None => return CommandOutput::failed(1, "Device is not a valid LUKS device."),
                    Some(key) if Some(key.as_slice()) != stdin => {
                        return CommandOutput::failed(2, "No key available with this passphrase.")
                    }
                    _ => {}
                }
                if self.mappings.iter().any(|(n, _)| n == name) {
                    return CommandOutput::failed(5, "Device already exists.");
                }
                self.mappings.push((name.to_string(), device.to_string()));
                CommandOutput::ok("")
            }
            ["close", name] => {
                let mapped = format!("/dev/mapper/{}", name);
                if self.mounts.iter().any(|m| m.source == mapped) {
                    return CommandOutput::failed(5, "Device is still in use.");
                }
                let before = self.mappings.len();
                self.mappings.retain(|(n, _)| n != name);
                self.filesystems.remove(&mapped);
                reply(self.mappings.len() < before, "", "Device is not active.")
            }
            ["luksUUID", device] => match self.filesystems.get(*device) {
                Some(fs) if fs.kind == "crypto_LUKS" => CommandOutput::ok(fs.uuid.clone()),
                _ => CommandOutput::failed(1, "Device is not a valid LUKS device."),
            },
            _ => CommandOutput::failed(1, "unsupported cryptsetup invocation"),
        }
    }

    fn mkfs(&mut self, kind: &str, args: &[&str]) -> CommandOutput {
        let Some(device) = args.last() else {
            return CommandOutput::failed(1, "no device");
        };
        if !self.device_exists(device) {
            return CommandOutput::failed(1, "No such device");
        }
        if self.mounts.iter().any(|m| m.source == *device) {
            return CommandOutput::failed(1, "Device is mounted");
        }
        self.filesystems.insert(
            device.to_string(),
            Filesystem {
                kind: kind.to_string(),
                uuid: Uuid::new_v4().to_string(),
            },
        );
        CommandOutput::ok("")
    }

    fn blkid(&self, args: &[&str]) -> CommandOutput {
        let (Some(tag), Some(device)) = (args.get(1), args.last()) else {
            return CommandOutput::failed(2, "");
        };
        let fs = if self.foreign.iter().any(|(p, _)| p == device) {
            self.fs_kind(device).map(|kind| Filesystem {
                kind,
                uuid: "ABCD-1234".to_string(),
            })
        } else {
            self.filesystems.get(*device).cloned()
        };
        match (fs, *tag) {
            (Some(fs), "TYPE") => CommandOutput::ok(fs.kind),
            (Some(fs), "UUID") => CommandOutput::ok(fs.uuid),
            _ => CommandOutput::failed(2, ""),
        }
    }

    fn mount(&mut self, args: &[&str]) -> CommandOutput {
        let mut options = String::new();
        let mut positional = Vec::new();
        let mut iter = args.iter().copied();
        while let Some(arg) = iter.next() {
            if arg == "-o" {
                options = iter.next().unwrap_or_default().to_string();
            } else {
                positional.push(arg);
            }
        }
        let [source, target] = positional.as_slice() else {
            return CommandOutput::failed(1, "mount: bad usage");
        };

        if !self.device_exists(source) {
            return CommandOutput::failed(32, &format!("mount: {}: special device does not exist", source));
        }
        if self.fs_kind(source).is_none() {
            return CommandOutput::failed(32, "mount: wrong fs type, bad option, bad superblock");
        }
        if !Path::new(target).is_dir() {
            return CommandOutput::failed(32, &format!("mount: {}: mount point does not exist", target));
        }

        if self.windows_boot.iter().any(|p| p == source) {
            let marker = PathBuf::from(target).join("EFI/Microsoft/Boot");
            if std::fs::create_dir_all(marker).is_err() {
                return CommandOutput::failed(32, "mount: cannot populate mock volume");
            }
        }

        self.mounts.push(MountRecord {
            source: source.to_string(),
            target: target.to_string(),
            options,
        });
        CommandOutput::ok("")
    }

    fn umount(&mut self, args: &[&str]) -> CommandOutput {
        let Some(target) = args.iter().copied().find(|a| !a.starts_with('-')) else {
            return CommandOutput::failed(1, "umount: bad usage");
        };
        let Some(pos) = self.mounts.iter().rposition(|m| m.target == target) else {
            return CommandOutput::failed(32, &format!("umount: {}: not mounted.", target));
        };
        let nested = format!("{}/", target.trim_end_matches('/'));
        if self.mounts.iter().any(|m| m.target.starts_with(&nested)) {
            return CommandOutput::failed(32, &format!("umount: {}: target is busy.", target));
        }

        let record = self.mounts.remove(pos);
        if self.windows_boot.contains(&record.source) {
            let _ = std::fs::remove_dir_all(Path::new(target).join("EFI"));
        }
        CommandOutput::ok("")
    }

    fn btrfs(&mut self, args: &[&str]) -> CommandOutput {
        let ["subvolume", "create", path] = args else {
            return CommandOutput::failed(1, "unsupported btrfs invocation");
        };
        let path = Path::new(path);
        let parent = path.parent().map(|p| p.to_string_lossy().to_string());
        let on_btrfs = self.mounts.iter().any(|m| {
            Some(&m.target) == parent.as_ref() && self.fs_kind(&m.source).as_deref() == Some("btrfs")
        });
        if !on_btrfs {
            return CommandOutput::failed(1, "ERROR: not a btrfs filesystem");
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        self.subvolumes.push(name);
        CommandOutput::ok("")
    }
}

impl CommandExecutor for MockDisk {
    fn execute(&self, program: &str, args: &[&str], stdin: Option<&[u8]>) -> Result<CommandOutput> {
        let mut st = self.state.borrow_mut();
        let line = format!("{} {}", program, args.join(" "));
        st.history.push(line.trim_end().to_string());

        let injected = st
            .failures
            .iter()
            .any(|(p, needle)| p == program && line.contains(needle.as_str()));
        if injected {
            return Ok(CommandOutput::failed(1, "injected failure"));
        }

        Ok(match program {
            "parted" => st.parted(args),
            "partprobe" | "udevadm" => CommandOutput::ok(""),
            "lsblk" => st.lsblk(args),
            "cryptsetup" => st.cryptsetup(args, stdin),
            "mkfs.btrfs" => st.mkfs("btrfs", args),
            "mkfs.vfat" => st.mkfs("vfat", args),
            "blkid" => st.blkid(args),
            "mount" => st.mount(args),
            "umount" => st.umount(args),
            "btrfs" => st.btrfs(args),
            other => CommandOutput::failed(127, &format!("{}: command not found", other)),
        })
    }
}
