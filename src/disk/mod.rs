//! Disk management modules

pub mod detection;
pub mod formatting;
pub mod free_space;
pub mod layouts;
pub mod partitioning;
pub mod volumes;
