//! Segment writer: owns the single open segment of a stream.
//!
//! Records are encoded into an in-memory buffer and written to the segment
//! file in one contiguous `write_all` per flush. A durability barrier is a
//! flush followed by `sync_data`; it runs before every segment rotation,
//! before every checkpoint save, and on close. The writer creates
//! directories as needed and never deletes files.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use crate::error::{io_at, ArchiveError};
use crate::record::{Entity, Record};
use crate::segment::{list_segment_files, SegmentRange};

/// Configuration for a [`SegmentWriter`].
#[derive(Debug, Clone)]
pub struct SegmentWriterConfig {
    pub output_dir: PathBuf,
    pub entity: Entity,
    pub segment_size: u64,
    /// Buffered records that force a flush.
    pub max_buffered_records: usize,
}

/// Counters for observability.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SegmentWriterStats {
    pub records_written: u64,
    pub bytes_written: u64,
    pub flushes: u64,
    pub barriers: u64,
    pub rotations: u64,
}

/// Result of a `write` that crossed a segment boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rotation {
    /// Segment that was closed, if one was open.
    pub closed: Option<SegmentRange>,
    pub opened: SegmentRange,
}

struct OpenSegment {
    range: SegmentRange,
    path: PathBuf,
    file: File,
}

/// What [`SegmentWriter::repair_tail`] removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TailRepair {
    pub files_truncated: usize,
    pub bytes_removed: u64,
}

/// Appends records to fixed-range segment files.
pub struct SegmentWriter {
    config: SegmentWriterConfig,
    current: Option<OpenSegment>,
    buffer: Vec<u8>,
    buffered_records: usize,
    stats: SegmentWriterStats,
}

impl SegmentWriter {
    pub fn new(config: SegmentWriterConfig) -> Result<Self, ArchiveError> {
        if config.segment_size == 0 {
            return Err(ArchiveError::Config("segment_size must be positive".into()));
        }
        fs::create_dir_all(&config.output_dir).map_err(io_at(&config.output_dir))?;
        Ok(Self {
            config,
            current: None,
            buffer: Vec::with_capacity(64 * 1024),
            buffered_records: 0,
            stats: SegmentWriterStats::default(),
        })
    }

    pub fn current_range(&self) -> Option<SegmentRange> {
        self.current.as_ref().map(|s| s.range)
    }

    pub fn current_path(&self) -> Option<&PathBuf> {
        self.current.as_ref().map(|s| &s.path)
    }

    pub fn buffered_records(&self) -> usize {
        self.buffered_records
    }

    pub fn stats(&self) -> &SegmentWriterStats {
        &self.stats
    }

    /// Appends `record` at `position`, rotating first if the position falls
    /// outside the open segment.
    pub fn write(
        &mut self,
        position: u64,
        record: &Record,
    ) -> Result<Option<Rotation>, ArchiveError> {
        if record.entity() != self.config.entity {
            return Err(ArchiveError::MalformedRecord(format!(
                "{} record handed to the {} writer",
                record.entity(),
                self.config.entity
            )));
        }
        if record.position() != position {
            return Err(ArchiveError::MalformedRecord(format!(
                "record position {} does not match write position {position}",
                record.position()
            )));
        }

        let range = SegmentRange::for_position(position, self.config.segment_size);
        let rotation = if self.current_range() != Some(range) {
            Some(self.rotate_to(range)?)
        } else {
            None
        };

        let line = record.to_line()?;
        self.buffer.extend_from_slice(line.as_bytes());
        self.buffer.push(b'\n');
        self.buffered_records += 1;

        if self.buffered_records >= self.config.max_buffered_records {
            self.flush()?;
        }
        Ok(rotation)
    }

    /// Writes the buffer to the open segment. Does not fsync.
    pub fn flush(&mut self) -> Result<(), ArchiveError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let Some(segment) = self.current.as_mut() else {
            return Err(ArchiveError::Other(
                "buffered records without an open segment".into(),
            ));
        };
        segment
            .file
            .write_all(&self.buffer)
            .map_err(io_at(&segment.path))?;

        self.stats.bytes_written += self.buffer.len() as u64;
        self.stats.records_written += self.buffered_records as u64;
        self.stats.flushes += 1;
        self.buffer.clear();
        self.buffered_records = 0;
        Ok(())
    }

    /// Flushes, then fsyncs the open segment.
    pub fn durability_barrier(&mut self) -> Result<(), ArchiveError> {
        self.flush()?;
        if let Some(segment) = self.current.as_ref() {
            segment.file.sync_data().map_err(io_at(&segment.path))?;
            self.stats.barriers += 1;
        }
        Ok(())
    }

    /// Makes the open segment durable and closes it.
    pub fn close(&mut self) -> Result<Option<SegmentRange>, ArchiveError> {
        self.durability_barrier()?;
        Ok(self.current.take().map(|s| s.range))
    }

    fn rotate_to(&mut self, range: SegmentRange) -> Result<Rotation, ArchiveError> {
        let closed = self.close()?;
        let name = range.file_name(self.config.entity.as_str());
        let path = self.config.output_dir.join(&name);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(io_at(&path))?;

        if let Some(closed) = closed {
            self.stats.rotations += 1;
            tracing::info!(
                entity = %self.config.entity,
                closed = %closed.file_name(self.config.entity.as_str()),
                opened = %name,
                "segment rotated"
            );
        } else {
            tracing::debug!(entity = %self.config.entity, segment = %name, "segment opened");
        }

        self.current = Some(OpenSegment { range, path, file });
        Ok(Rotation {
            closed,
            opened: range,
        })
    }

    /// Removes records a crash left beyond the last checkpoint.
    ///
    /// Every segment that may hold positions at or after `resume_position` is
    /// scanned and truncated at the first such line, or at a trailing line
    /// with no newline. Must run before the first write of a resumed stream.
    pub fn repair_tail(&self, resume_position: u64) -> Result<TailRepair, ArchiveError> {
        let mut repair = TailRepair::default();
        let entity = self.config.entity;
        let files = list_segment_files(&self.config.output_dir, entity.as_str())?;

        for file in files {
            if file.range.end < resume_position {
                continue;
            }

            let keep = committed_prefix_len(&file.path, entity, resume_position)?;
            let len = fs::metadata(&file.path).map_err(io_at(&file.path))?.len();
            if keep < len {
                let handle = OpenOptions::new()
                    .write(true)
                    .open(&file.path)
                    .map_err(io_at(&file.path))?;
                handle.set_len(keep).map_err(io_at(&file.path))?;
                handle.sync_all().map_err(io_at(&file.path))?;

                tracing::warn!(
                    entity = %entity,
                    segment = %file.name,
                    kept_bytes = keep,
                    removed_bytes = len - keep,
                    "truncated records written after the last checkpoint"
                );
                repair.files_truncated += 1;
                repair.bytes_removed += len - keep;
            }
        }
        Ok(repair)
    }

    /// Highest position with a complete record in the segment files.
    ///
    /// Used when no checkpoint claims anything but segments already exist
    /// (first run against a pre-existing archive, or a reset checkpoint).
    /// The newest segment holding a record is fsynced before its position
    /// is reported. That position may hold only part of its records.
    pub fn recover_last_position(&self) -> Result<Option<u64>, ArchiveError> {
        let entity = self.config.entity;
        let files = list_segment_files(&self.config.output_dir, entity.as_str())?;

        for file in files.iter().rev() {
            let handle = File::open(&file.path).map_err(io_at(&file.path))?;
            let mut reader = BufReader::with_capacity(1 << 20, handle);
            let mut line = Vec::new();
            let mut highest = None;
            loop {
                line.clear();
                let n = reader.read_until(b'\n', &mut line).map_err(io_at(&file.path))?;
                if n == 0 || line.last() != Some(&b'\n') {
                    break;
                }
                if let Ok(record) = Record::parse_line(entity, &line) {
                    highest = highest.max(Some(record.position()));
                }
            }
            if highest.is_some() {
                File::open(&file.path)
                    .and_then(|f| f.sync_all())
                    .map_err(io_at(&file.path))?;
                return Ok(highest);
            }
        }
        Ok(None)
    }
}

/// Byte length of the leading complete lines positioned before
/// `resume_position`.
fn committed_prefix_len(
    path: &Path,
    entity: Entity,
    resume_position: u64,
) -> Result<u64, ArchiveError> {
    let file = File::open(path).map_err(io_at(path))?;
    let mut reader = BufReader::with_capacity(1 << 20, file);
    let mut line = Vec::new();
    let mut offset = 0u64;

    loop {
        line.clear();
        let n = reader.read_until(b'\n', &mut line).map_err(io_at(path))?;
        if n == 0 || line.last() != Some(&b'\n') {
            break;
        }
        // A complete line we cannot parse is kept; readers skip it.
        if let Ok(record) = Record::parse_line(entity, &line) {
            if record.position() >= resume_position {
                break;
            }
        }
        offset += n as u64;
    }
    Ok(offset)
}

impl Drop for SegmentWriter {
    fn drop(&mut self) {
        if self.current.is_some() {
            if let Err(e) = self.durability_barrier() {
                tracing::error!(entity = %self.config.entity, error = %e, "failed to flush segment on drop");
            }
        }
    }
}
