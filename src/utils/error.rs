//! Error types for diskprep

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("Must be run as root")]
    NotRoot,

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Device is not a block device: {0}")]
    NotBlockDevice(String),

    #[error("Insufficient space: {0}")]
    InsufficientSpace(String),

    #[error("Invalid size: {0:?}")]
    InvalidSizeInput(String),

    #[error("Passphrases do not match")]
    PassphraseMismatch,

    #[error("Partition table write failed: {0}")]
    PartitionTableWriteFailed(String),

    #[error("Format failed: {0}")]
    FormatFailed(String),

    #[error("Mount failed: {0}")]
    MountFailed(String),

    #[error("Could not open encrypted container: {0}")]
    EncryptionOpenFailed(String),

    #[error("Foreign EFI scan failed: {0}")]
    ForeignEfiScanFailed(String),

    #[error("Could not read disk topology: {0}")]
    ProbeFailed(String),

    #[error("{step} failed (last known good state: {last_good}): {source}")]
    StepFailed {
        step: String,
        last_good: String,
        #[source]
        source: Box<ProvisionError>,
    },

    #[error("Command failed: {command}\n{stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("Command not found: {0}")]
    CommandNotFound(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("User cancelled operation")]
    UserCancelled,

    #[error("Interrupted before {0}")]
    Interrupted(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ProvisionError {
    /// The underlying error, looking through any `StepFailed` wrapping.
    pub fn kind(&self) -> &ProvisionError {
        match self {
            ProvisionError::StepFailed { source, .. } => source.kind(),
            other => other,
        }
    }

    /// Whether the caller may re-prompt instead of aborting.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.kind(),
            ProvisionError::PassphraseMismatch | ProvisionError::InvalidSizeInput(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ProvisionError>;
