//! Free-space discovery
//!
//! Parses parted's machine-readable free-space listing into [`FreeSegment`]s.
//! This is the only place that interprets that listing.

use crate::disk::detection::parse_parted_bytes;
use crate::utils::command::CommandRunner;
use crate::utils::error::{ProvisionError, Result};
use crate::utils::units::format_size;
use serde::Serialize;
use std::fmt;
use tracing::debug;

/// Partition boundaries are kept on 1 MiB multiples
pub const PARTITION_ALIGNMENT: u64 = 1024 * 1024;

/// Protective MBR, primary GPT header and entry array (512-byte sectors)
pub const GPT_HEAD_BYTES: u64 = 34 * 512;

/// Backup entry array and header at the end of the disk
pub const GPT_TAIL_BYTES: u64 = 33 * 512;

/// A contiguous range of unallocated bytes, `start..end`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct FreeSegment {
    pub start: u64,
    pub end: u64,
    pub size: u64,
}

impl FreeSegment {
    pub fn new(start: u64, end: u64) -> Self {
        let end = end.max(start);
        Self {
            start,
            end,
            size: end - start,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Whether `start..end` lies entirely inside this segment
    pub fn contains(&self, start: u64, end: u64) -> bool {
        start >= self.start && end <= self.end && start <= end
    }

    /// Shrink to alignment boundaries. The start moves up to the next
    /// multiple of `alignment`; the end is left alone.
    pub fn aligned(&self, alignment: u64) -> Self {
        let start = self.start.div_ceil(alignment) * alignment;
        Self::new(start.min(self.end), self.end)
    }
}

impl fmt::Display for FreeSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} free at {}..{}",
            format_size(self.size),
            self.start,
            self.end
        )
    }
}

/// Free ranges exactly as parted lists them, with exclusive ends
fn parse_free_ranges(output: &str) -> Result<Vec<FreeSegment>> {
    let mut ranges = Vec::new();

    for line in output.lines().map(str::trim) {
        let fields: Vec<&str> = line.trim_end_matches(';').split(':').collect();
        if fields.len() != 5 || fields[4] != "free" {
            continue;
        }

        let malformed = || ProvisionError::ProbeFailed(format!("malformed free-space line: {}", line));
        let start = parse_parted_bytes(fields[1]).ok_or_else(malformed)?;
        let last = parse_parted_bytes(fields[2]).ok_or_else(malformed)?;
        ranges.push(FreeSegment::new(start, last + 1));
    }

    Ok(ranges)
}

fn align_all(ranges: impl IntoIterator<Item = FreeSegment>) -> Vec<FreeSegment> {
    ranges
        .into_iter()
        .map(|r| r.aligned(PARTITION_ALIGNMENT))
        .filter(|s| !s.is_empty())
        .collect()
}

/// Parse `parted -m unit B print free` output into aligned free segments.
///
/// parted reports inclusive end offsets; the segments returned here use
/// exclusive ends. Gaps smaller than the alignment vanish.
pub fn parse_free_segments(output: &str) -> Result<Vec<FreeSegment>> {
    Ok(align_all(parse_free_ranges(output)?))
}

/// Merge released partition ranges into unaligned free ranges. Ranges that
/// touch or overlap become one.
pub fn merge_released(free: &[FreeSegment], released: &[(u64, u64)]) -> Vec<FreeSegment> {
    let mut ranges: Vec<(u64, u64)> = free
        .iter()
        .map(|f| (f.start, f.end))
        .chain(released.iter().copied())
        .filter(|(start, end)| end > start)
        .collect();
    ranges.sort_unstable();

    let mut merged: Vec<(u64, u64)> = Vec::with_capacity(ranges.len());
    for (start, end) in ranges {
        match merged.last_mut() {
            Some(last) if start <= last.1 => last.1 = last.1.max(end),
            _ => merged.push((start, end)),
        }
    }

    merged
        .into_iter()
        .map(|(start, end)| FreeSegment::new(start, end))
        .collect()
}

/// The aligned free segment a freshly written GPT label leaves on a disk of
/// `disk_size` bytes
pub fn fresh_gpt_segment(disk_size: u64) -> FreeSegment {
    FreeSegment::new(GPT_HEAD_BYTES, disk_size.saturating_sub(GPT_TAIL_BYTES))
        .aligned(PARTITION_ALIGNMENT)
}

/// The biggest segment, or a zero-sized one if there is none.
///
/// Equal sizes are resolved in favour of the lowest start offset, so the
/// answer depends only on the table and never on listing order.
pub fn pick_largest(segments: &[FreeSegment]) -> FreeSegment {
    segments
        .iter()
        .copied()
        .max_by(|a, b| a.size.cmp(&b.size).then(b.start.cmp(&a.start)))
        .unwrap_or_default()
}

fn print_free(cmd: &CommandRunner, disk: &str) -> Result<String> {
    cmd.query("parted", &["-m", "-s", disk, "unit", "B", "print", "free"])
        .map_err(|e| ProvisionError::ProbeFailed(format!("{}: {}", disk, e)))
}

/// All free segments on `disk`'s current partition table
pub fn free_segments(cmd: &CommandRunner, disk: &str) -> Result<Vec<FreeSegment>> {
    let segments = parse_free_segments(&print_free(cmd, disk)?)?;
    debug!("Free segments on {}: {:?}", disk, segments);
    Ok(segments)
}

/// Aligned free segments `disk` will have once the partitions covering
/// `released` are deleted. Reads the table without changing it.
pub fn free_segments_after(
    cmd: &CommandRunner,
    disk: &str,
    released: &[(u64, u64)],
) -> Result<Vec<FreeSegment>> {
    let ranges = parse_free_ranges(&print_free(cmd, disk)?)?;
    Ok(align_all(merge_released(&ranges, released)))
}

/// Largest free segment on `disk`
pub fn largest_free_segment(cmd: &CommandRunner, disk: &str) -> Result<FreeSegment> {
    Ok(pick_largest(&free_segments(cmd, disk)?))
}

/// Sum of all free segments. Informational only: the space is not
/// contiguous and must not be used for sizing.
pub fn total_free_bytes(segments: &[FreeSegment]) -> u64 {
    segments.iter().map(|s| s.size).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;
    const GIB: u64 = 1024 * MIB;

    #[test]
    fn parses_empty_gpt_disk() {
        let output = "BYT;
/dev/vda:21474836480B:virtblk:512:512:gpt:Virtio Block Device:;
1:17408B:21474819583B:21474802176B:free;
";
        let segments = parse_free_segments(output).unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].start, MIB);
        assert_eq!(segments[0].end, 21_474_819_584);
        assert_eq!(segments[0].size, segments[0].end - segments[0].start);
    }

    #[test]
    fn drops_alignment_slivers() {
        let output = "BYT;
/dev/sda:214748364800B:scsi:512:512:gpt:ATA Samsung SSD:;
1:17408B:1048575B:1031168B:free;
1:1048576B:105906175B:104857600B:fat32:EFI system partition:boot, esp;
3:122683392B:107496865791B:107374182400B:ntfs:Basic data partition:msftdata;
1:107496865792B:161183956991B:53687091200B:free;
1:161183956992B:214748347903B:53564390912B:free;
";
        let segments = parse_free_segments(output).unwrap();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0], FreeSegment::new(107_496_865_792, 161_183_956_992));
        assert_eq!(segments[0].size, 50 * GIB);
    }

    #[test]
    fn unaligned_starts_round_up() {
        let segment = FreeSegment::new(MIB + 512, 10 * MIB).aligned(MIB);
        assert_eq!(segment.start, 2 * MIB);
        assert_eq!(segment.size, 8 * MIB);

        let sliver = FreeSegment::new(MIB + 512, MIB + 4096).aligned(MIB);
        assert!(sliver.is_empty());
    }

    #[test]
    fn largest_prefers_size_then_lowest_start() {
        let a = FreeSegment::new(10 * GIB, 20 * GIB);
        let b = FreeSegment::new(30 * GIB, 40 * GIB);
        let c = FreeSegment::new(50 * GIB, 55 * GIB);

        assert_eq!(pick_largest(&[c, b, a]), a);
        assert_eq!(pick_largest(&[a, b, c]), a);
        assert_eq!(pick_largest(&[c]), c);
        assert!(pick_largest(&[]).is_empty());
    }

    #[test]
    fn released_partitions_join_neighbouring_gaps() {
        let free = [
            FreeSegment::new(17_408, MIB),
            FreeSegment::new(10 * GIB, 20 * GIB),
        ];
        // partition 2 at 5..10 GiB is deleted; 1 MiB..5 GiB stays
        let merged = merge_released(&free, &[(5 * GIB, 10 * GIB)]);
        assert_eq!(
            merged,
            vec![FreeSegment::new(17_408, MIB), FreeSegment::new(5 * GIB, 20 * GIB)]
        );

        let aligned = align_all(merged);
        assert_eq!(pick_largest(&aligned), FreeSegment::new(5 * GIB, 20 * GIB));
    }

    #[test]
    fn fresh_label_matches_parted_listing() {
        let listed = "BYT;
/dev/vda:21474836480B:virtblk:512:512:gpt:Virtio Block Device:;
1:17408B:21474819583B:21474802176B:free;
";
        let parsed = parse_free_segments(listed).unwrap();
        assert_eq!(fresh_gpt_segment(20 * GIB), parsed[0]);
        assert!(fresh_gpt_segment(0).is_empty());
    }

    #[test]
    fn totals_are_informational() {
        let segments = [FreeSegment::new(0, GIB), FreeSegment::new(2 * GIB, 4 * GIB)];
        assert_eq!(total_free_bytes(&segments), 3 * GIB);
        assert_eq!(pick_largest(&segments).size, 2 * GIB);
    }
}
