//! LUKS encryption setup

use crate::utils::command::CommandRunner;
use crate::utils::error::{ProvisionError, Result};
use serde::Serialize;
use tracing::{info, warn};

/// An opened LUKS container
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LuksContainer {
    /// Raw partition holding the LUKS header
    pub device: String,
    /// Device-mapper name (e.g. "cryptroot")
    pub mapper_name: String,
    /// Plaintext device (e.g. "/dev/mapper/cryptroot")
    pub mapped_path: String,
    /// Header UUID, as referenced by crypttab and kernel command lines
    pub luks_uuid: String,
}

pub fn mapped_path(mapper_name: &str) -> String {
    format!("/dev/mapper/{}", mapper_name)
}

/// Initialise a LUKS2 header on `device`. The passphrase is passed on
/// stdin so it never appears in the process list or the audit log.
pub fn luks_format(cmd: &CommandRunner, device: &str, passphrase: &str) -> Result<()> {
    info!("Initialising LUKS2 container on {}", device);

    cmd.run_with_input(
        "cryptsetup",
        &[
            "luksFormat",
            "--type",
            "luks2",
            "--batch-mode",
            "--key-file=-",
            device,
        ],
        passphrase.as_bytes(),
    )
    .map(|_| ())
    .map_err(|e| ProvisionError::FormatFailed(format!("LUKS format of {}: {}", device, e)))
}

/// Open the container on `device` as `/dev/mapper/<mapper_name>` and read
/// its header UUID
pub fn open_luks(
    cmd: &CommandRunner,
    device: &str,
    mapper_name: &str,
    passphrase: &str,
) -> Result<LuksContainer> {
    info!("Opening {} as {}", device, mapper_name);

    cmd.run_with_input(
        "cryptsetup",
        &["open", "--key-file=-", device, mapper_name],
        passphrase.as_bytes(),
    )
    .map_err(|e| ProvisionError::EncryptionOpenFailed(format!("{}: {}", device, e)))?;

    // The caller only tracks the mapping once this returns
    let uuid = match luks_uuid(cmd, device) {
        Ok(uuid) => uuid,
        Err(e) => {
            close_luks(cmd, mapper_name);
            return Err(e);
        }
    };

    Ok(LuksContainer {
        device: device.to_string(),
        mapper_name: mapper_name.to_string(),
        mapped_path: mapped_path(mapper_name),
        luks_uuid: uuid,
    })
}

/// Header UUID of the container on `device`
pub fn luks_uuid(cmd: &CommandRunner, device: &str) -> Result<String> {
    cmd.query("cryptsetup", &["luksUUID", device])
        .map_err(|e| ProvisionError::EncryptionOpenFailed(format!("luksUUID {}: {}", device, e)))
}

/// Close a mapping. Failures are logged, not returned: this runs on
/// teardown paths that must keep going.
pub fn close_luks(cmd: &CommandRunner, mapper_name: &str) -> bool {
    info!("Closing {}", mapper_name);
    match cmd.run("cryptsetup", &["close", mapper_name]) {
        Ok(_) => true,
        Err(e) => {
            warn!("Failed to close {}: {}", mapper_name, e);
            false
        }
    }
}
