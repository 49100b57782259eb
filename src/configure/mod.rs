//! Storage configuration steps

pub mod encryption;
