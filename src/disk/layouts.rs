//! Partition layout planning
//!
//! Places an EFI system partition at the start of a free segment and the
//! root partition directly behind it. Every bound is checked against the
//! segment, never the whole disk, so a plan can never reach into
//! partitions that already exist.

use crate::disk::free_space::{FreeSegment, PARTITION_ALIGNMENT};
use crate::utils::error::{ProvisionError, Result};
use crate::utils::units::{format_size, parse_size, GIB, MIB};
use serde::Serialize;

/// EFI size used by the automatic policy
pub const EFI_AUTO_BYTES: u64 = GIB;

/// Smallest EFI partition firmware reliably accepts
pub const EFI_MIN_BYTES: u64 = 32 * MIB;

/// Smallest root the automatic policy will create
pub const MIN_ROOT_BYTES: u64 = 8 * GIB;

/// How partition sizes are chosen
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SizingPolicy {
    /// 1 GiB EFI, root takes the rest of the segment
    Automatic,
    /// Explicit EFI size; `root_bytes: None` means "rest of the segment"
    Custom {
        efi_bytes: u64,
        root_bytes: Option<u64>,
    },
}

impl SizingPolicy {
    /// Build a custom policy from user-entered size strings. An empty or
    /// missing root size means "use the remainder".
    pub fn custom_from_strings(efi: &str, root: Option<&str>) -> Result<Self> {
        let efi_bytes = parse_size(efi)?;
        let root_bytes = match root.map(str::trim) {
            None | Some("") => None,
            Some(r) => Some(parse_size(r)?),
        };
        Ok(SizingPolicy::Custom {
            efi_bytes,
            root_bytes,
        })
    }

    pub fn efi_bytes(&self) -> u64 {
        match self {
            SizingPolicy::Automatic => EFI_AUTO_BYTES,
            SizingPolicy::Custom { efi_bytes, .. } => *efi_bytes,
        }
    }
}

impl std::fmt::Display for SizingPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Automatic => write!(f, "Automatic (1G EFI, root = remainder)"),
            Self::Custom {
                efi_bytes,
                root_bytes,
            } => write!(
                f,
                "Custom ({} EFI, root = {})",
                format_size(*efi_bytes),
                root_bytes.map(format_size).unwrap_or_else(|| "remainder".to_string())
            ),
        }
    }
}

/// One partition to be created, `start..end` in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PlannedPartition {
    /// Partition number the table is expected to assign
    pub index: u32,
    pub start: u64,
    pub end: u64,
}

impl PlannedPartition {
    pub fn size(&self) -> u64 {
        self.end - self.start
    }
}

/// EFI + root placement inside one free segment
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionPlan {
    pub segment: FreeSegment,
    pub efi: PlannedPartition,
    pub root: PlannedPartition,
}

/// The `count` lowest partition numbers not in `taken`
pub fn next_free_indices(taken: &[u32], count: usize) -> Vec<u32> {
    (1u32..)
        .filter(|n| !taken.contains(n))
        .take(count)
        .collect()
}

fn insufficient(what: &str, needed: u64, segment: &FreeSegment) -> ProvisionError {
    ProvisionError::InsufficientSpace(format!(
        "{} needs {} but the free segment {}..{} holds {}",
        what,
        format_size(needed),
        segment.start,
        segment.end,
        format_size(segment.size)
    ))
}

/// Round `bytes` up to the partition alignment. Custom sizes may be
/// fractional ("32.3M") or raw byte counts that fall between sectors.
fn align_size(bytes: u64, what: &str, segment: &FreeSegment) -> Result<u64> {
    bytes
        .checked_next_multiple_of(PARTITION_ALIGNMENT)
        .ok_or_else(|| insufficient(what, bytes, segment))
}

/// Compute the partition plan for `segment`.
///
/// `taken_indices` are the partition numbers already in use; the plan
/// predicts the two lowest free ones. Custom sizes are rounded up to whole
/// MiB so every boundary stays aligned. Never touches the device.
pub fn plan_layout(
    segment: &FreeSegment,
    policy: &SizingPolicy,
    taken_indices: &[u32],
) -> Result<PartitionPlan> {
    let efi_size = align_size(policy.efi_bytes(), "EFI partition", segment)?;
    if matches!(policy, SizingPolicy::Custom { .. }) && efi_size < EFI_MIN_BYTES {
        return Err(ProvisionError::InsufficientSpace(format!(
            "EFI partition of {} is below the {} minimum",
            format_size(efi_size),
            format_size(EFI_MIN_BYTES)
        )));
    }

    let efi_start = segment.start;
    let efi_end = efi_start
        .checked_add(efi_size)
        .filter(|end| *end <= segment.end)
        .ok_or_else(|| insufficient("EFI partition", efi_size, segment))?;

    let root_start = efi_end;
    let root_end = match policy {
        SizingPolicy::Custom {
            root_bytes: Some(root_size),
            ..
        } => {
            let root_size = align_size(*root_size, "root partition", segment)?;
            root_start
                .checked_add(root_size)
                .filter(|end| *end <= segment.end)
                .ok_or_else(|| insufficient("EFI + root", efi_size.saturating_add(root_size), segment))?
        }
        SizingPolicy::Automatic => {
            if segment.end - root_start < MIN_ROOT_BYTES {
                return Err(insufficient(
                    "Automatic layout",
                    EFI_AUTO_BYTES + MIN_ROOT_BYTES,
                    segment,
                ));
            }
            segment.end
        }
        SizingPolicy::Custom {
            root_bytes: None, ..
        } => segment.end,
    };

    if root_end <= root_start {
        return Err(insufficient("root partition", 1, segment));
    }

    let indices = next_free_indices(taken_indices, 2);
    Ok(PartitionPlan {
        segment: *segment,
        efi: PlannedPartition {
            index: indices[0],
            start: efi_start,
            end: efi_end,
        },
        root: PlannedPartition {
            index: indices[1],
            start: root_start,
            end: root_end,
        },
    })
}

/// Print plan summary
pub fn print_plan_summary(device: &str, plan: &PartitionPlan) {
    println!("\nPartition plan for {} ({}):", device, plan.segment);
    println!(
        "{:<6} {:<6} {:>16} {:>16} {:>10}",
        "NUM", "NAME", "START", "END", "SIZE"
    );
    println!("{}", "-".repeat(60));

    for (name, part) in [("EFI", &plan.efi), ("ROOT", &plan.root)] {
        println!(
            "{:<6} {:<6} {:>16} {:>16} {:>10}",
            part.index,
            name,
            part.start,
            part.end,
            format_size(part.size())
        );
    }
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment_gib(start_mib: u64, size_gib: u64) -> FreeSegment {
        FreeSegment::new(start_mib * MIB, start_mib * MIB + size_gib * GIB)
    }

    fn assert_plan_invariants(plan: &PartitionPlan, segment: &FreeSegment) {
        assert_eq!(plan.efi.start, segment.start);
        assert!(plan.efi.end > plan.efi.start);
        assert!(plan.efi.end <= segment.end);
        assert_eq!(plan.root.start, plan.efi.end);
        assert!(plan.root.end > plan.root.start);
        assert!(plan.root.end <= segment.end);
    }

    #[test]
    fn automatic_uses_one_gib_efi_and_remainder() {
        let segment = segment_gib(1, 20);
        let plan = plan_layout(&segment, &SizingPolicy::Automatic, &[]).unwrap();

        assert_plan_invariants(&plan, &segment);
        assert_eq!(plan.efi.size(), GIB);
        assert_eq!(plan.efi.start, MIB);
        assert_eq!(plan.root.start, 1025 * MIB);
        assert_eq!(plan.root.end, segment.end);
        assert_eq!((plan.efi.index, plan.root.index), (1, 2));
    }

    #[test]
    fn automatic_requires_minimum_root() {
        let exact = FreeSegment::new(0, EFI_AUTO_BYTES + MIN_ROOT_BYTES);
        assert!(plan_layout(&exact, &SizingPolicy::Automatic, &[]).is_ok());

        let short = FreeSegment::new(0, EFI_AUTO_BYTES + MIN_ROOT_BYTES - 1);
        assert!(matches!(
            plan_layout(&short, &SizingPolicy::Automatic, &[]),
            Err(ProvisionError::InsufficientSpace(_))
        ));
    }

    #[test]
    fn automatic_property_over_many_segment_sizes() {
        for size_mib in (512..40 * 1024).step_by(733) {
            let segment = FreeSegment::new(3 * MIB, 3 * MIB + size_mib * MIB);
            let result = plan_layout(&segment, &SizingPolicy::Automatic, &[]);
            if segment.size >= EFI_AUTO_BYTES + MIN_ROOT_BYTES {
                let plan = result.unwrap();
                assert_eq!(plan.efi.size(), GIB);
                assert_plan_invariants(&plan, &segment);
            } else {
                assert!(matches!(result, Err(ProvisionError::InsufficientSpace(_))));
            }
        }
    }

    #[test]
    fn custom_remainder_ends_exactly_at_segment_end() {
        let segment = FreeSegment::new(107_496_865_792, 107_496_865_792 + 50 * GIB);
        let policy = SizingPolicy::custom_from_strings("512M", None).unwrap();
        let plan = plan_layout(&segment, &policy, &[1, 2, 3, 4]).unwrap();

        assert_plan_invariants(&plan, &segment);
        assert_eq!(plan.efi.size(), 512 * MIB);
        assert_eq!(plan.root.end, segment.end);
        assert_eq!((plan.efi.index, plan.root.index), (5, 6));
    }

    #[test]
    fn custom_explicit_root() {
        let segment = segment_gib(1, 30);
        let policy = SizingPolicy::Custom {
            efi_bytes: 512 * MIB,
            root_bytes: Some(20 * GIB),
        };
        let plan = plan_layout(&segment, &policy, &[]).unwrap();
        assert_plan_invariants(&plan, &segment);
        assert_eq!(plan.root.size(), 20 * GIB);
        assert!(plan.root.end < segment.end);
    }

    #[test]
    fn custom_root_must_fit() {
        let segment = segment_gib(1, 10);
        let policy = SizingPolicy::Custom {
            efi_bytes: GIB,
            root_bytes: Some(9 * GIB + 1),
        };
        assert!(matches!(
            plan_layout(&segment, &policy, &[]),
            Err(ProvisionError::InsufficientSpace(_))
        ));
    }

    #[test]
    fn custom_efi_too_small_or_too_big() {
        let segment = segment_gib(1, 10);
        let tiny = SizingPolicy::Custom {
            efi_bytes: 16 * MIB,
            root_bytes: None,
        };
        assert!(matches!(
            plan_layout(&segment, &tiny, &[]),
            Err(ProvisionError::InsufficientSpace(_))
        ));

        let whole = SizingPolicy::Custom {
            efi_bytes: 10 * GIB,
            root_bytes: None,
        };
        assert!(matches!(
            plan_layout(&segment, &whole, &[]),
            Err(ProvisionError::InsufficientSpace(_))
        ));
    }

    #[test]
    fn fractional_and_byte_sizes_round_up_to_mib() {
        let segment = FreeSegment::new(MIB, 20 * GIB);

        let policy = SizingPolicy::custom_from_strings("32.3M", None).unwrap();
        let plan = plan_layout(&segment, &policy, &[]).unwrap();
        assert_eq!(plan.efi.size(), 33 * MIB);
        assert_eq!(plan.root.start % MIB, 0);
        assert_plan_invariants(&plan, &segment);

        let policy = SizingPolicy::custom_from_strings("512M", Some("536870913")).unwrap();
        let plan = plan_layout(&segment, &policy, &[]).unwrap();
        assert_eq!(plan.root.size(), 513 * MIB);
        assert_eq!(plan.root.start % MIB, 0);
        assert_eq!(plan.root.end % MIB, 0);
    }

    #[test]
    fn zero_segment_fails() {
        assert!(plan_layout(&FreeSegment::default(), &SizingPolicy::Automatic, &[]).is_err());
    }

    #[test]
    fn invalid_size_strings_are_rejected() {
        assert!(matches!(
            SizingPolicy::custom_from_strings("abc", None),
            Err(ProvisionError::InvalidSizeInput(_))
        ));
        assert_eq!(
            SizingPolicy::custom_from_strings("1G", Some("  ")).unwrap(),
            SizingPolicy::Custom {
                efi_bytes: GIB,
                root_bytes: None
            }
        );
    }

    #[test]
    fn indices_fill_gaps() {
        assert_eq!(next_free_indices(&[1, 2, 4], 2), vec![3, 5]);
        assert_eq!(next_free_indices(&[], 2), vec![1, 2]);
    }
}
