//! Utility modules

pub mod audit;
pub mod command;
pub mod error;
#[cfg(any(test, feature = "test-support"))]
pub mod mock;
pub mod prompt;
pub mod signal;
pub mod units;
