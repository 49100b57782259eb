//! Provisioning orchestration

mod provisioner;

pub use provisioner::*;
