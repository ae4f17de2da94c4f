//! Segment naming: maps a position to its fixed-size range and file name.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{io_at, ArchiveError};

/// Zero-padded width of the start/end numbers in a segment file name.
pub const SEGMENT_NAME_WIDTH: usize = 9;

/// Extension of segment files.
pub const SEGMENT_EXTENSION: &str = "jsonl";

/// Inclusive position range covered by one segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SegmentRange {
    pub start: u64,
    pub end: u64,
}

impl SegmentRange {
    /// Range holding `position` for the given segment size.
    ///
    /// # Panics
    ///
    /// Panics if `segment_size` is zero.
    pub fn for_position(position: u64, segment_size: u64) -> Self {
        assert!(segment_size > 0, "segment_size must be positive");
        let start = position / segment_size * segment_size;
        Self {
            start,
            end: start.saturating_add(segment_size - 1),
        }
    }

    pub fn contains(&self, position: u64) -> bool {
        self.start <= position && position <= self.end
    }

    /// Number of whole segments that precede this one.
    pub fn ordinal(&self, segment_size: u64) -> u64 {
        self.start / segment_size.max(1)
    }

    pub fn file_name(&self, entity: &str) -> String {
        format!(
            "{entity}_{:0w$}_{:0w$}.{SEGMENT_EXTENSION}",
            self.start,
            self.end,
            w = SEGMENT_NAME_WIDTH
        )
    }
}

/// `(start, end)` of the segment holding `position`.
pub fn segment_range_for(position: u64, segment_size: u64) -> SegmentRange {
    SegmentRange::for_position(position, segment_size)
}

/// File name of the segment holding `position`.
pub fn segment_file_name(entity: &str, position: u64, segment_size: u64) -> String {
    segment_range_for(position, segment_size).file_name(entity)
}

/// Parses `{entity}_{start}_{end}.jsonl` back into its range.
pub fn parse_segment_file_name(entity: &str, name: &str) -> Option<SegmentRange> {
    let rest = name.strip_prefix(entity)?.strip_prefix('_')?;
    let rest = rest.strip_suffix(SEGMENT_EXTENSION)?.strip_suffix('.')?;
    let (start, end) = rest.split_once('_')?;
    if start.is_empty()
        || end.is_empty()
        || !start.bytes().all(|b| b.is_ascii_digit())
        || !end.bytes().all(|b| b.is_ascii_digit())
    {
        return None;
    }
    let range = SegmentRange {
        start: start.parse().ok()?,
        end: end.parse().ok()?,
    };
    (range.start <= range.end).then_some(range)
}

/// A segment file found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentFile {
    pub range: SegmentRange,
    pub name: String,
    pub path: PathBuf,
}

/// Lists the segment files of `entity` in `dir`, ordered by position.
///
/// A missing directory is treated as empty.
pub fn list_segment_files(dir: &Path, entity: &str) -> Result<Vec<SegmentFile>, ArchiveError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(ArchiveError::io(dir, e)),
    };

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(io_at(dir))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if let Some(range) = parse_segment_file_name(entity, &name) {
            files.push(SegmentFile {
                range,
                path: entry.path(),
                name,
            });
        }
    }
    files.sort_by(|a, b| a.range.cmp(&b.range).then_with(|| a.name.cmp(&b.name)));
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_boundaries() {
        assert_eq!(
            segment_range_for(0, 10_000),
            SegmentRange { start: 0, end: 9_999 }
        );
        assert_eq!(
            segment_range_for(9_999, 10_000),
            SegmentRange { start: 0, end: 9_999 }
        );
        assert_eq!(
            segment_range_for(10_000, 10_000),
            SegmentRange { start: 10_000, end: 19_999 }
        );
        assert_eq!(segment_range_for(17, 1), SegmentRange { start: 17, end: 17 });
    }

    #[test]
    fn same_segment_for_every_position_in_range() {
        let size = 250;
        for p in 0..2_000u64 {
            let range = segment_range_for(p, size);
            assert_eq!(range.start, p / size * size);
            assert_eq!(range.end, range.start + size - 1);
            assert!(range.contains(p));
            if p % size != 0 {
                assert_eq!(range, segment_range_for(p - 1, size));
            }
        }
    }

    #[test]
    #[should_panic(expected = "segment_size must be positive")]
    fn zero_segment_size_panics() {
        segment_range_for(5, 0);
    }

    #[test]
    fn file_names_sort_like_positions() {
        let a = segment_file_name("txids", 0, 10_000);
        let b = segment_file_name("txids", 10_005, 10_000);
        let c = segment_file_name("txids", 120_000, 10_000);
        assert_eq!(a, "txids_000000000_000009999.jsonl");
        assert_eq!(b, "txids_000010000_000019999.jsonl");
        assert!(a < b && b < c);
    }

    #[test]
    fn parse_round_trips_and_rejects_foreign_names() {
        let name = segment_file_name("blocks", 42, 100);
        assert_eq!(
            parse_segment_file_name("blocks", &name),
            Some(SegmentRange { start: 0, end: 99 })
        );
        assert_eq!(parse_segment_file_name("txids", &name), None);
        assert_eq!(parse_segment_file_name("blocks", "blocks_1_x.jsonl"), None);
        assert_eq!(parse_segment_file_name("blocks", "blocks_9_1.jsonl"), None);
        assert_eq!(
            parse_segment_file_name("blocks", "blocks_000000000_000000099.jsonl.tmp"),
            None
        );
    }

    #[test]
    fn listing_sorts_and_filters() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            "txids_000000200_000000299.jsonl",
            "txids_000000000_000000099.jsonl",
            "blocks_000000000_000000099.jsonl",
            "notes.txt",
        ] {
            fs::write(dir.path().join(name), b"").unwrap();
        }
        let files = list_segment_files(dir.path(), "txids").unwrap();
        let names: Vec<_> = files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(
            names,
            ["txids_000000000_000000099.jsonl", "txids_000000200_000000299.jsonl"]
        );
        assert!(list_segment_files(&dir.path().join("missing"), "txids")
            .unwrap()
            .is_empty());
    }
}
