//! Configuration management

mod provision;

pub use provision::*;
