//! Size string parsing and formatting

use crate::utils::error::{ProvisionError, Result};
use once_cell::sync::Lazy;
use regex::Regex;

pub const KIB: u64 = 1024;
pub const MIB: u64 = KIB * 1024;
pub const GIB: u64 = MIB * 1024;
pub const TIB: u64 = GIB * 1024;

static SIZE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?i)\s*(\d+(?:\.\d+)?)\s*([kmgt])(?:i?b)?\s*$").expect("static size regex")
});

/// Parse a size such as `512M`, `1G`, `1.5GiB` or a raw byte count.
///
/// Suffixes are binary (K = 1024). Zero is rejected, so a successful
/// result can always be used as a partition size.
pub fn parse_size(input: &str) -> Result<u64> {
    let trimmed = input.trim();
    let invalid = || ProvisionError::InvalidSizeInput(input.to_string());

    let bytes = if !trimmed.is_empty() && trimmed.chars().all(|c| c.is_ascii_digit()) {
        trimmed.parse::<u64>().map_err(|_| invalid())?
    } else {
        let caps = SIZE_RE.captures(trimmed).ok_or_else(invalid)?;
        let magnitude: f64 = caps[1].parse().map_err(|_| invalid())?;
        let multiplier = match caps[2].to_ascii_uppercase().as_str() {
            "K" => KIB,
            "M" => MIB,
            "G" => GIB,
            "T" => TIB,
            _ => return Err(invalid()),
        };
        let bytes = magnitude * multiplier as f64;
        if !bytes.is_finite() || bytes >= u64::MAX as f64 {
            return Err(invalid());
        }
        bytes as u64
    };

    if bytes == 0 {
        return Err(invalid());
    }
    Ok(bytes)
}

/// Human-readable binary size (e.g. `1.0G`)
pub fn format_size(bytes: u64) -> String {
    if bytes >= TIB {
        format!("{:.1}T", bytes as f64 / TIB as f64)
    } else if bytes >= GIB {
        format!("{:.1}G", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.1}M", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.1}K", bytes as f64 / KIB as f64)
    } else {
        format!("{}B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_binary_suffixes() {
        assert_eq!(parse_size("1G").unwrap(), 1_073_741_824);
        assert_eq!(parse_size("512M").unwrap(), 536_870_912);
        assert_eq!(parse_size("64k").unwrap(), 65_536);
        assert_eq!(parse_size("2GiB").unwrap(), 2 * GIB);
        assert_eq!(parse_size("1.5G").unwrap(), GIB + 512 * MIB);
        assert_eq!(parse_size(" 300 MB ").unwrap(), 300 * MIB);
    }

    #[test]
    fn raw_numbers_are_bytes() {
        assert_eq!(parse_size("4096").unwrap(), 4096);
    }

    #[test]
    fn rejects_garbage_and_zero() {
        for bad in ["abc", "", "G", "12X", "-5M", "0", "0M", "1.2.3G"] {
            assert!(
                matches!(parse_size(bad), Err(ProvisionError::InvalidSizeInput(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn formats_sizes() {
        assert_eq!(format_size(512), "512B");
        assert_eq!(format_size(GIB), "1.0G");
        assert_eq!(format_size(50 * GIB + 512 * MIB), "50.5G");
    }
}
