//! diskprep library - dual-boot-safe partition planning and storage provisioning

pub mod cleanup;
pub mod config;
pub mod configure;
pub mod disk;
pub mod install;
pub mod utils;

pub use config::ProvisionConfig;
pub use install::{PlanPreview, ProvisionedStorage, Provisioner};
pub use utils::error::ProvisionError;
