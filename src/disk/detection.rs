//! Disk detection and enumeration

use crate::utils::command::CommandRunner;
use crate::utils::error::{ProvisionError, Result};
use crate::utils::units::format_size;
use serde::{Deserialize, Deserializer, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Directory whose presence on a FAT volume marks a Windows boot manager
pub const WINDOWS_EFI_MARKER: &str = "EFI/Microsoft";

/// Information about a block device
#[derive(Debug, Clone, Serialize)]
pub struct BlockDevice {
    /// Device path (e.g., /dev/sda)
    pub path: String,
    /// Device name (e.g., sda)
    pub name: String,
    /// Size in bytes
    pub size_bytes: u64,
    /// Device model (if available)
    pub model: Option<String>,
    /// Device type (nvme, ssd, hdd, usb, ...)
    pub device_type: String,
    pub removable: bool,
    pub read_only: bool,
}

impl BlockDevice {
    /// Get human-readable size
    pub fn size_human(&self) -> String {
        format_size(self.size_bytes)
    }
}

/// One existing partition on the target disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionEntry {
    /// 1-based partition number
    pub index: u32,
    /// First byte of the partition
    pub start: u64,
    /// One past the last byte of the partition
    pub end: u64,
    pub size: u64,
    /// Filesystem as reported by parted (empty when unknown)
    pub filesystem: String,
    /// GPT partition name
    pub name: String,
    pub flags: Vec<String>,
}

impl PartitionEntry {
    pub fn is_esp(&self) -> bool {
        self.flags.iter().any(|f| f == "esp")
    }
}

/// Partition table as read from the device
#[derive(Debug, Clone, Serialize)]
pub struct PartitionTable {
    pub device: String,
    pub size_bytes: u64,
    /// Label type (`gpt`, `msdos`, `unknown`)
    pub label: String,
    pub partitions: Vec<PartitionEntry>,
}

/// Resolve the device node of partition `index` on `device`.
///
/// Devices whose name ends in a digit (nvme0n1, mmcblk0, loop0) take a `p`
/// separator before the partition number.
pub fn partition_path(device: &str, index: u32) -> String {
    if device.ends_with(|c: char| c.is_ascii_digit()) {
        format!("{}p{}", device, index)
    } else {
        format!("{}{}", device, index)
    }
}

/// Read a sysfs attribute, returning None if not available
fn read_sysfs_attr(sysfs: &Path, device: &str, attr: &str) -> Option<String> {
    fs::read_to_string(sysfs.join(device).join(attr))
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn read_sysfs_u64(sysfs: &Path, device: &str, attr: &str) -> Option<u64> {
    read_sysfs_attr(sysfs, device, attr).and_then(|s| s.parse().ok())
}

/// Determine device type from its name and sysfs attributes
fn determine_device_type(sysfs: &Path, device: &str) -> String {
    if device.starts_with("nvme") {
        return "nvme".to_string();
    }
    if device.starts_with("mmcblk") {
        return "mmc".to_string();
    }
    if device.starts_with("loop") {
        return "loop".to_string();
    }
    if read_sysfs_u64(sysfs, device, "removable").unwrap_or(0) == 1 {
        return "usb".to_string();
    }
    match read_sysfs_u64(sysfs, device, "queue/rotational") {
        Some(0) => "ssd".to_string(),
        Some(_) => "hdd".to_string(),
        None => "disk".to_string(),
    }
}

/// List whole-disk block devices
///
/// If `all` is false, filters to suitable installation targets (no loop,
/// ram, zram or device-mapper nodes, nothing read-only or under 1 GiB).
pub fn list_block_devices(all: bool) -> Result<Vec<BlockDevice>> {
    list_block_devices_in(Path::new("/sys/block"), all)
}

/// [`list_block_devices`] against an arbitrary sysfs block directory
pub fn list_block_devices_in(sysfs: &Path, all: bool) -> Result<Vec<BlockDevice>> {
    let mut devices = Vec::new();

    for entry in fs::read_dir(sysfs)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();

        let virtual_node = ["ram", "zram", "dm-", "sr"]
            .iter()
            .any(|prefix| name.starts_with(prefix));
        let device_type = determine_device_type(sysfs, &name);
        if !all && (virtual_node || device_type == "loop") {
            continue;
        }

        let size_sectors = read_sysfs_u64(sysfs, &name, "size").unwrap_or(0);
        if size_sectors == 0 {
            continue;
        }
        // sysfs always reports the size in 512-byte units
        let size_bytes = size_sectors * 512;

        if !all && size_bytes < 1024 * 1024 * 1024 {
            continue;
        }

        let removable = read_sysfs_u64(sysfs, &name, "removable").unwrap_or(0) == 1;
        let read_only = read_sysfs_u64(sysfs, &name, "ro").unwrap_or(0) == 1;
        if !all && read_only {
            continue;
        }

        let model = read_sysfs_attr(sysfs, &name, "device/model")
            .or_else(|| read_sysfs_attr(sysfs, &name, "device/name"));

        devices.push(BlockDevice {
            path: format!("/dev/{}", name),
            name,
            size_bytes,
            model,
            device_type,
            removable,
            read_only,
        });
    }

    devices.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(devices)
}

/// Node of `lsblk --json` output
#[derive(Debug, Clone, Deserialize)]
pub struct LsblkDevice {
    pub name: String,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub fstype: Option<String>,
    #[serde(default, deserialize_with = "lsblk_size")]
    pub size: Option<u64>,
    #[serde(default)]
    pub children: Vec<LsblkDevice>,
}

impl LsblkDevice {
    pub fn device_path(&self) -> String {
        self.path
            .clone()
            .unwrap_or_else(|| format!("/dev/{}", self.name))
    }

    /// This node and all of its descendants, depth first
    pub fn flatten(&self) -> Vec<&LsblkDevice> {
        let mut nodes = vec![self];
        for child in &self.children {
            nodes.extend(child.flatten());
        }
        nodes
    }
}

#[derive(Debug, Deserialize)]
struct LsblkOutput {
    blockdevices: Vec<LsblkDevice>,
}

/// Older util-linux prints sizes as strings even with `--bytes`
fn lsblk_size<'de, D>(deserializer: D) -> std::result::Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::Number(n)) => n.as_u64(),
        Some(serde_json::Value::String(s)) => s.parse().ok(),
        _ => None,
    })
}

/// Parse `lsblk --json --bytes` output
pub fn parse_lsblk(json: &str) -> Result<Vec<LsblkDevice>> {
    let output: LsblkOutput = serde_json::from_str(json)?;
    Ok(output.blockdevices)
}

const LSBLK_COLUMNS: &str = "NAME,PATH,TYPE,FSTYPE,SIZE";

/// Whether `disk` currently carries any partition
pub fn has_partitions(cmd: &CommandRunner, disk: &str) -> Result<bool> {
    let json = cmd
        .query("lsblk", &["--json", "--bytes", "-o", LSBLK_COLUMNS, disk])
        .map_err(|_| ProvisionError::DeviceNotFound(disk.to_string()))?;
    let devices = parse_lsblk(&json)?;

    let found = devices
        .iter()
        .flat_map(|d| d.flatten())
        .any(|d| d.kind == "part");
    debug!("{} has partitions: {}", disk, found);
    Ok(found)
}

/// Size of `disk` in bytes. Works on disks without a partition table.
pub fn disk_size(cmd: &CommandRunner, disk: &str) -> Result<u64> {
    let json = cmd
        .query("lsblk", &["--json", "--bytes", "-o", LSBLK_COLUMNS, disk])
        .map_err(|_| ProvisionError::DeviceNotFound(disk.to_string()))?;

    parse_lsblk(&json)?
        .iter()
        .find(|d| d.device_path() == disk)
        .and_then(|d| d.size)
        .ok_or_else(|| ProvisionError::ProbeFailed(format!("lsblk reported no size for {}", disk)))
}

/// Strip the `B` unit parted appends in `unit B` mode
pub(crate) fn parse_parted_bytes(field: &str) -> Option<u64> {
    field.trim().trim_end_matches('B').parse().ok()
}

/// Parse `parted -m unit B print` output. Free-space lines are ignored.
pub fn parse_partition_table(output: &str) -> Result<PartitionTable> {
    let mut lines = output.lines().map(str::trim).filter(|l| !l.is_empty());

    match lines.next() {
        Some("BYT;") => {}
        other => {
            return Err(ProvisionError::ProbeFailed(format!(
                "unexpected parted header: {:?}",
                other
            )))
        }
    }

    let device_line = lines
        .next()
        .ok_or_else(|| ProvisionError::ProbeFailed("missing device line".to_string()))?;
    let device_fields: Vec<&str> = device_line.trim_end_matches(';').split(':').collect();
    if device_fields.len() < 6 {
        return Err(ProvisionError::ProbeFailed(format!(
            "malformed device line: {}",
            device_line
        )));
    }
    let size_bytes = parse_parted_bytes(device_fields[1]).ok_or_else(|| {
        ProvisionError::ProbeFailed(format!("bad disk size: {}", device_fields[1]))
    })?;

    let mut partitions = Vec::new();
    for line in lines {
        let body = line.trim_end_matches(';');
        let fields: Vec<&str> = body.splitn(7, ':').collect();
        if fields.len() == 5 && fields[4] == "free" {
            continue;
        }
        if fields.len() < 4 {
            return Err(ProvisionError::ProbeFailed(format!("malformed line: {}", line)));
        }

        let parse = |f: &str| {
            parse_parted_bytes(f)
                .ok_or_else(|| ProvisionError::ProbeFailed(format!("malformed line: {}", line)))
        };
        let index: u32 = fields[0]
            .parse()
            .map_err(|_| ProvisionError::ProbeFailed(format!("malformed line: {}", line)))?;
        let start = parse(fields[1])?;
        let end = parse(fields[2])? + 1;
        let size = parse(fields[3])?;

        partitions.push(PartitionEntry {
            index,
            start,
            end,
            size,
            filesystem: fields.get(4).unwrap_or(&"").to_string(),
            name: fields.get(5).unwrap_or(&"").to_string(),
            flags: fields
                .get(6)
                .map(|f| {
                    f.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
        });
    }

    Ok(PartitionTable {
        device: device_fields[0].to_string(),
        size_bytes,
        label: device_fields[5].to_string(),
        partitions,
    })
}

/// Read the current partition table of `disk`
pub fn read_partition_table(cmd: &CommandRunner, disk: &str) -> Result<PartitionTable> {
    let output = cmd
        .query("parted", &["-m", "-s", disk, "unit", "B", "print"])
        .map_err(|e| ProvisionError::ProbeFailed(format!("{}: {}", disk, e)))?;
    parse_partition_table(&output)
}

/// Existing partitions on `disk`
pub fn list_partitions(cmd: &CommandRunner, disk: &str) -> Result<Vec<PartitionEntry>> {
    Ok(read_partition_table(cmd, disk)?.partitions)
}

/// A read-only mount in a private temporary directory.
///
/// Unmounted and its directory removed when dropped.
pub struct ScratchMount<'a> {
    cmd: &'a CommandRunner,
    dir: PathBuf,
}

impl<'a> ScratchMount<'a> {
    /// Mount `device` read-only in a fresh directory under `base`
    pub fn mount_read_only(cmd: &'a CommandRunner, device: &str, base: &Path) -> Result<Self> {
        let dir = base.join(format!("diskprep-scan-{}", Uuid::new_v4()));
        fs::create_dir_all(&dir)?;

        let target = dir.to_string_lossy().to_string();
        if let Err(e) = cmd.run_scratch("mount", &["-o", "ro", device, &target]) {
            let _ = fs::remove_dir(&dir);
            return Err(ProvisionError::MountFailed(format!("{}: {}", device, e)));
        }

        Ok(Self { cmd, dir })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }
}

impl Drop for ScratchMount<'_> {
    fn drop(&mut self) {
        let target = self.dir.to_string_lossy().to_string();
        if let Err(e) = self.cmd.run_scratch("umount", &[&target]) {
            warn!("Failed to unmount {}: {} (trying lazy unmount)", target, e);
            let _ = self.cmd.run_scratch("umount", &["-l", &target]);
        }
        if let Err(e) = fs::remove_dir(&self.dir) {
            warn!("Could not remove scratch directory {}: {}", target, e);
        }
    }
}

/// Look for another OS's boot files on every FAT volume in the system.
///
/// Returns the first device carrying `marker` (relative to the volume
/// root). Volumes that fail to mount are skipped.
pub fn find_foreign_efi(cmd: &CommandRunner, marker: &str) -> Result<Option<String>> {
    find_foreign_efi_in(cmd, marker, &std::env::temp_dir())
}

/// [`find_foreign_efi`] with scratch mounts created under `scratch_base`
pub fn find_foreign_efi_in(
    cmd: &CommandRunner,
    marker: &str,
    scratch_base: &Path,
) -> Result<Option<String>> {
    let json = cmd
        .query("lsblk", &["--json", "--bytes", "-o", LSBLK_COLUMNS])
        .map_err(|e| ProvisionError::ForeignEfiScanFailed(e.to_string()))?;
    let devices =
        parse_lsblk(&json).map_err(|e| ProvisionError::ForeignEfiScanFailed(e.to_string()))?;

    let candidates: Vec<String> = devices
        .iter()
        .flat_map(|d| d.flatten())
        .filter(|d| d.fstype.as_deref() == Some("vfat"))
        .map(|d| d.device_path())
        .collect();
    debug!("FAT volumes to scan: {:?}", candidates);

    for device in candidates {
        let scratch = match ScratchMount::mount_read_only(cmd, &device, scratch_base) {
            Ok(s) => s,
            Err(e) => {
                warn!("Skipping {}: {}", device, e);
                continue;
            }
        };

        if scratch.path().join(marker).is_dir() {
            info!("Found foreign EFI boot files on {}", device);
            return Ok(Some(device));
        }
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOWS_TABLE: &str = "BYT;
/dev/sda:214748364800B:scsi:512:512:gpt:ATA Samsung SSD:;
1:1048576B:105906175B:104857600B:fat32:EFI system partition:boot, esp;
2:105906176B:122683391B:16777216B::Microsoft reserved partition:msftres;
3:122683392B:107496865791B:107374182400B:ntfs:Basic data partition:msftdata;
";

    #[test]
    fn test_partition_path() {
        assert_eq!(partition_path("/dev/sda", 2), "/dev/sda2");
        assert_eq!(partition_path("/dev/nvme0n1", 1), "/dev/nvme0n1p1");
        assert_eq!(partition_path("/dev/mmcblk0", 3), "/dev/mmcblk0p3");
        assert_eq!(partition_path("/dev/vdb", 10), "/dev/vdb10");
        // pure: same input, same output
        assert_eq!(partition_path("/dev/sda", 2), partition_path("/dev/sda", 2));
    }

    #[test]
    fn parses_parted_table() {
        let table = parse_partition_table(WINDOWS_TABLE).unwrap();
        assert_eq!(table.device, "/dev/sda");
        assert_eq!(table.label, "gpt");
        assert_eq!(table.size_bytes, 214_748_364_800);
        assert_eq!(table.partitions.len(), 3);

        let esp = &table.partitions[0];
        assert!(esp.is_esp());
        assert_eq!(esp.start, 1_048_576);
        assert_eq!(esp.end, 105_906_176);
        assert_eq!(esp.end - esp.start, esp.size);
        assert_eq!(esp.flags, vec!["boot", "esp"]);

        assert_eq!(table.partitions[1].filesystem, "");
        assert_eq!(table.partitions[2].filesystem, "ntfs");
    }

    #[test]
    fn free_lines_are_not_partitions() {
        let output = "BYT;
/dev/vda:21474836480B:virtblk:512:512:gpt:Virtio Block Device:;
1:17408B:21474819583B:21474802176B:free;
";
        let table = parse_partition_table(output).unwrap();
        assert!(table.partitions.is_empty());
    }

    #[test]
    fn rejects_unknown_output() {
        assert!(matches!(
            parse_partition_table("Error: /dev/sdz: unrecognised disk label"),
            Err(ProvisionError::ProbeFailed(_))
        ));
    }

    #[test]
    fn lsblk_accepts_numeric_and_string_sizes() {
        let json = r#"{"blockdevices":[
            {"name":"sda","path":"/dev/sda","type":"disk","fstype":null,"size":"500107862016",
             "children":[{"name":"sda1","path":"/dev/sda1","type":"part","fstype":"vfat","size":104857600}]}
        ]}"#;
        let devices = parse_lsblk(json).unwrap();
        assert_eq!(devices[0].size, Some(500_107_862_016));
        let nodes = devices[0].flatten();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[1].fstype.as_deref(), Some("vfat"));
        assert_eq!(nodes[1].device_path(), "/dev/sda1");
    }

    #[test]
    fn lists_devices_from_sysfs() {
        let sysfs = tempfile::tempdir().unwrap();
        let add = |name: &str, attrs: &[(&str, &str)]| {
            for (attr, value) in attrs {
                let path = sysfs.path().join(name).join(attr);
                fs::create_dir_all(path.parent().unwrap()).unwrap();
                fs::write(path, value).unwrap();
            }
        };
        add(
            "sda",
            &[("size", "41943040\n"), ("device/model", "VBOX HARDDISK  \n"), ("queue/rotational", "1")],
        );
        add("nvme0n1", &[("size", "1000215216")]);
        add("loop0", &[("size", "409600")]);
        add("sr0", &[("size", "2097152"), ("ro", "1")]);

        let devices = list_block_devices_in(sysfs.path(), false).unwrap();
        let names: Vec<&str> = devices.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["nvme0n1", "sda"]);
        assert_eq!(devices[1].size_bytes, 20 * 1024 * 1024 * 1024);
        assert_eq!(devices[1].model.as_deref(), Some("VBOX HARDDISK"));
        assert_eq!(devices[1].device_type, "hdd");
        assert_eq!(devices[0].device_type, "nvme");

        let all = list_block_devices_in(sysfs.path(), true).unwrap();
        assert_eq!(all.len(), 4);
    }
}
