//! Provisioning run configuration

use crate::disk::detection::{list_block_devices, list_partitions};
use crate::disk::layouts::SizingPolicy;
use crate::utils::command::CommandRunner;
use crate::utils::error::{ProvisionError, Result};
use crate::utils::prompt::*;
use crate::utils::units::{format_size, parse_size};
use serde::{Deserialize, Serialize};
use std::os::unix::fs::FileTypeExt;
use std::path::Path;

/// Everything one provisioning run needs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionConfig {
    pub disk: DiskConfig,
    #[serde(default)]
    pub layout: LayoutConfig,
    #[serde(default)]
    pub encryption: EncryptionConfig,
    #[serde(default)]
    pub mount: MountConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskConfig {
    /// Target device path (e.g., /dev/sda)
    pub device: String,
    /// Partition numbers to delete before planning
    #[serde(default)]
    pub delete_partitions: Vec<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayoutConfig {
    #[serde(default)]
    pub policy: PolicyKind,
    /// EFI size for the custom policy (e.g. "512M")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub efi_size: Option<String>,
    /// Root size for the custom policy; absent means the rest of the segment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_size: Option<String>,
    /// Format the new EFI partition as FAT32
    #[serde(default = "default_true")]
    pub format_efi: bool,
    /// btrfs filesystem label
    #[serde(default = "default_filesystem_label")]
    pub filesystem_label: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionConfig {
    /// Put the root filesystem inside a LUKS2 container
    #[serde(default)]
    pub enabled: bool,
    /// Passphrase (prompted for when absent)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<String>,
    /// Device-mapper name of the opened container
    #[serde(default = "default_mapper_name")]
    pub mapper_name: String,
    /// How often a mismatched passphrase confirmation may be retried
    #[serde(default = "default_passphrase_attempts")]
    pub passphrase_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountConfig {
    /// Where the new tree is assembled
    #[serde(default = "default_mount_root")]
    pub root: String,
    /// Pause after each partition table write for device nodes to appear
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PolicyKind {
    /// 1 GiB EFI, root takes the rest
    #[default]
    Automatic,
    /// Sizes from `efi_size` / `root_size`
    Custom,
}

impl std::fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Automatic => write!(f, "Automatic (1G EFI, root uses the remaining space)"),
            Self::Custom => write!(f, "Custom (choose the EFI and root sizes)"),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_filesystem_label() -> String {
    "ROOT".to_string()
}

fn default_mapper_name() -> String {
    "cryptroot".to_string()
}

fn default_passphrase_attempts() -> u32 {
    3
}

fn default_mount_root() -> String {
    "/mnt".to_string()
}

fn default_settle_delay_ms() -> u64 {
    2000
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            policy: PolicyKind::Automatic,
            efi_size: None,
            root_size: None,
            format_efi: true,
            filesystem_label: default_filesystem_label(),
        }
    }
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            passphrase: None,
            mapper_name: default_mapper_name(),
            passphrase_attempts: default_passphrase_attempts(),
        }
    }
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            root: default_mount_root(),
            settle_delay_ms: default_settle_delay_ms(),
        }
    }
}

impl ProvisionConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: ProvisionConfig = toml::from_str(content)?;
        Ok(config)
    }

    /// Serialize to TOML (passphrase included if set)
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Minimal configuration for `device` with every default
    pub fn for_device(device: &str) -> Self {
        Self {
            disk: DiskConfig {
                device: device.to_string(),
                delete_partitions: Vec::new(),
            },
            layout: LayoutConfig::default(),
            encryption: EncryptionConfig::default(),
            mount: MountConfig::default(),
        }
    }

    /// The sizing policy described by `[layout]`
    pub fn sizing_policy(&self) -> Result<SizingPolicy> {
        match self.layout.policy {
            PolicyKind::Automatic => Ok(SizingPolicy::Automatic),
            PolicyKind::Custom => {
                let efi = self.layout.efi_size.as_deref().ok_or_else(|| {
                    ProvisionError::ValidationError(
                        "custom layout needs layout.efi_size".to_string(),
                    )
                })?;
                SizingPolicy::custom_from_strings(efi, self.layout.root_size.as_deref())
            }
        }
    }

    /// Create configuration interactively
    pub fn from_wizard(cmd: &CommandRunner, device: Option<String>) -> Result<Self> {
        println!("\nDisk provisioning wizard\n");

        // Disk selection
        let device = if let Some(d) = device {
            d
        } else {
            let devices = list_block_devices(false)?;
            if devices.is_empty() {
                return Err(ProvisionError::ConfigError(
                    "No suitable disks found".to_string(),
                ));
            }
            let items: Vec<String> = devices
                .iter()
                .map(|d| {
                    format!(
                        "{} - {} {}",
                        d.path,
                        d.size_human(),
                        d.model.as_deref().unwrap_or("")
                    )
                })
                .collect();
            let idx = prompt_select("Select target disk", &items, 0)?;
            devices[idx].path.clone()
        };

        let mut config = Self::for_device(&device);

        // Existing partitions may be freed first; an unlabeled disk has none
        let partitions = list_partitions(cmd, &device).unwrap_or_default();
        if !partitions.is_empty() {
            let items: Vec<String> = partitions
                .iter()
                .map(|p| {
                    format!(
                        "#{} {} {} {}",
                        p.index,
                        format_size(p.size),
                        p.filesystem,
                        p.name
                    )
                })
                .collect();
            let chosen = prompt_multi_select(
                "Partitions to delete (space to toggle, enter to keep all)",
                &items,
            )?;
            config.disk.delete_partitions = chosen.iter().map(|&i| partitions[i].index).collect();
        }

        let policies = [PolicyKind::Automatic, PolicyKind::Custom];
        let policy_idx = prompt_select("Partition sizing", &policies, 0)?;
        config.layout.policy = policies[policy_idx];

        if config.layout.policy == PolicyKind::Custom {
            let efi = prompt_parsed("EFI partition size", Some("512M"), |s| {
                parse_size(s).map(|_| s.trim().to_string())
            })?;
            let root = prompt_parsed("Root partition size (empty = remaining space)", Some(""), |s| {
                if s.trim().is_empty() {
                    Ok(None)
                } else {
                    parse_size(s).map(|_| Some(s.trim().to_string()))
                }
            })?;
            config.layout.efi_size = Some(efi);
            config.layout.root_size = root;
        }

        config.layout.format_efi = prompt_confirm("Format the new EFI partition as FAT32?", true)?;

        config.encryption.enabled = prompt_confirm("Encrypt the root partition (LUKS2)?", false)?;
        if config.encryption.enabled {
            config.encryption.passphrase =
                Some(prompt_passphrase(config.encryption.passphrase_attempts)?);
        }

        config.mount.root = prompt_input("Mount root", Some(default_mount_root().as_str()))?;

        Ok(config)
    }

    /// Generate a sample configuration
    pub fn sample() -> Self {
        ProvisionConfig {
            disk: DiskConfig {
                device: "/dev/sda".to_string(),
                delete_partitions: Vec::new(),
            },
            layout: LayoutConfig {
                policy: PolicyKind::Custom,
                efi_size: Some("512M".to_string()),
                root_size: None,
                format_efi: true,
                filesystem_label: default_filesystem_label(),
            },
            encryption: EncryptionConfig {
                enabled: true,
                passphrase: None,
                mapper_name: default_mapper_name(),
                passphrase_attempts: default_passphrase_attempts(),
            },
            mount: MountConfig::default(),
        }
    }

    /// Validate the configuration, including the target device
    pub fn validate(&self) -> Result<()> {
        // Check device exists
        if !Path::new(&self.disk.device).exists() {
            return Err(ProvisionError::DeviceNotFound(self.disk.device.clone()));
        }

        // Check device is a block device
        let metadata = std::fs::metadata(&self.disk.device)?;
        if !metadata.file_type().is_block_device() {
            return Err(ProvisionError::NotBlockDevice(self.disk.device.clone()));
        }

        self.validate_settings()
    }

    /// Checks that need no access to the device
    pub fn validate_settings(&self) -> Result<()> {
        if !self.disk.device.starts_with("/dev/") {
            return Err(ProvisionError::ValidationError(format!(
                "disk.device must be a /dev path, got {:?}",
                self.disk.device
            )));
        }

        if self.disk.delete_partitions.contains(&0) {
            return Err(ProvisionError::ValidationError(
                "partition numbers start at 1".to_string(),
            ));
        }

        // Surfaces bad size strings before anything is touched
        self.sizing_policy()?;

        let label = &self.layout.filesystem_label;
        if label.is_empty() || label.len() > 255 {
            return Err(ProvisionError::ValidationError(
                "layout.filesystem_label must be 1 to 255 bytes".to_string(),
            ));
        }

        let mapper = &self.encryption.mapper_name;
        if mapper.is_empty() || mapper.contains('/') || mapper.contains(char::is_whitespace) {
            return Err(ProvisionError::ValidationError(format!(
                "invalid encryption.mapper_name {:?}",
                mapper
            )));
        }
        if self.encryption.passphrase_attempts == 0 {
            return Err(ProvisionError::ValidationError(
                "encryption.passphrase_attempts must be at least 1".to_string(),
            ));
        }
        if matches!(&self.encryption.passphrase, Some(p) if p.is_empty()) {
            return Err(ProvisionError::ValidationError(
                "encryption.passphrase cannot be empty".to_string(),
            ));
        }

        if !Path::new(&self.mount.root).is_absolute() || self.mount.root.trim_end_matches('/').is_empty() {
            return Err(ProvisionError::ValidationError(format!(
                "mount.root must be an absolute path other than /, got {:?}",
                self.mount.root
            )));
        }

        Ok(())
    }
}
