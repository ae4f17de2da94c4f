//! Checkpoint store: persists ingestion progress for crash recovery.
//!
//! A checkpoint records the last position whose records are durable in the
//! segment files. On restart the ingestion loop resumes right after it.
//! The checkpoint must never run ahead of the data, so callers save it only
//! after a segment durability barrier.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::ArchiveError;
use crate::persist::{self, LoadOrigin};
use crate::record::Entity;
use crate::segment::SegmentRange;

/// Durable ingestion progress for one stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointState {
    pub entity: Entity,
    pub segment_size: u64,
    /// Last position fully written and fsynced. `None` before the first save.
    #[serde(
        default,
        alias = "last_height",
        deserialize_with = "deserialize_position"
    )]
    pub last_position_written: Option<u64>,
    #[serde(default)]
    pub current_segment_start: u64,
    #[serde(default)]
    pub current_segment_end: u64,
    #[serde(default, deserialize_with = "persist::null_as_default")]
    pub segments_completed: u64,
    #[serde(
        default,
        alias = "events_written_total",
        deserialize_with = "persist::null_as_default"
    )]
    pub records_written_total: u64,
    #[serde(default, alias = "updated_utc")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Older checkpoints use `-1` for "nothing written yet".
fn deserialize_position<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u64>, D::Error> {
    let raw = Option::<i64>::deserialize(d)?;
    Ok(raw.and_then(|v| u64::try_from(v).ok()))
}

impl CheckpointState {
    /// Fresh state: nothing written, first segment starting at `start_position`.
    pub fn new(entity: Entity, segment_size: u64, start_position: u64) -> Self {
        let range = SegmentRange::for_position(start_position, segment_size);
        Self {
            entity,
            segment_size,
            last_position_written: None,
            current_segment_start: range.start,
            current_segment_end: range.end,
            segments_completed: range.ordinal(segment_size),
            records_written_total: 0,
            updated_at: None,
        }
    }

    /// Position the loop should process next.
    pub fn resume_position(&self, start_position: u64) -> u64 {
        match self.last_position_written {
            Some(p) => p + 1,
            None => start_position,
        }
    }

    /// Records durable progress through `position`.
    pub fn advance(&mut self, position: u64, records_written: u64) {
        let range = SegmentRange::for_position(position, self.segment_size);
        self.last_position_written = Some(position);
        self.current_segment_start = range.start;
        self.current_segment_end = range.end;
        self.segments_completed = range.ordinal(self.segment_size);
        self.records_written_total += records_written;
    }

    pub fn touch(&mut self) {
        self.updated_at = Some(Utc::now());
    }

    /// Rejects a checkpoint that belongs to a differently configured stream.
    pub fn ensure_compatible(&self, entity: Entity, segment_size: u64) -> Result<(), ArchiveError> {
        if self.entity != entity {
            return Err(ArchiveError::CheckpointMismatch {
                entity: entity.to_string(),
                reason: format!("checkpoint belongs to '{}'", self.entity),
            });
        }
        if self.segment_size != segment_size && self.last_position_written.is_some() {
            return Err(ArchiveError::CheckpointMismatch {
                entity: entity.to_string(),
                reason: format!(
                    "segment_size is {} on disk but {} configured",
                    self.segment_size, segment_size
                ),
            });
        }
        Ok(())
    }
}

/// Trait for loading and saving checkpoints.
///
/// Implementations include [`FileCheckpointStore`] and
/// [`MemoryCheckpointStore`].
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Load the checkpoint, creating defaults when none exists.
    async fn load(
        &self,
        entity: Entity,
        segment_size: u64,
        start_position: u64,
    ) -> Result<CheckpointState, ArchiveError>;

    /// Replace the stored checkpoint.
    async fn save(&self, state: &CheckpointState) -> Result<(), ArchiveError>;
}

/// Checkpoint kept as one JSON document, replaced atomically on every save.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    path: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(
        &self,
        entity: Entity,
        segment_size: u64,
        start_position: u64,
    ) -> Result<CheckpointState, ArchiveError> {
        let loaded = persist::load_json_or_default(&self.path, || {
            let mut state = CheckpointState::new(entity, segment_size, start_position);
            state.touch();
            state
        })?;

        match &loaded.origin {
            LoadOrigin::Existing => {}
            LoadOrigin::Created => tracing::info!(
                path = %self.path.display(),
                %entity,
                "created checkpoint with defaults"
            ),
            LoadOrigin::Reset { reason } => tracing::warn!(
                path = %self.path.display(),
                %entity,
                reason = %reason,
                "checkpoint unreadable, moved aside and reset to defaults"
            ),
        }

        let mut state = loaded.value;
        state.ensure_compatible(entity, segment_size)?;
        if state.last_position_written.is_none() {
            state.segment_size = segment_size;
        }
        Ok(state)
    }

    async fn save(&self, state: &CheckpointState) -> Result<(), ArchiveError> {
        persist::write_json_atomic(&self.path, state)
    }
}

/// Reads a checkpoint without creating or repairing it.
///
/// Used by consumers that only need the committed watermark.
pub fn read_checkpoint(path: &Path) -> Result<Option<CheckpointState>, ArchiveError> {
    persist::read_json(path)
}

// ─── In-memory store (for testing) ────────────────────────────────────────────

use std::sync::Mutex;

/// In-memory checkpoint store for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    data: Mutex<Option<CheckpointState>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Option<CheckpointState> {
        self.data.lock().ok().and_then(|d| d.clone())
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(
        &self,
        entity: Entity,
        segment_size: u64,
        start_position: u64,
    ) -> Result<CheckpointState, ArchiveError> {
        let mut data = self
            .data
            .lock()
            .map_err(|_| ArchiveError::Other("checkpoint lock poisoned".into()))?;
        let state = data
            .get_or_insert_with(|| CheckpointState::new(entity, segment_size, start_position))
            .clone();
        state.ensure_compatible(entity, segment_size)?;
        Ok(state)
    }

    async fn save(&self, state: &CheckpointState) -> Result<(), ArchiveError> {
        let mut data = self
            .data
            .lock()
            .map_err(|_| ArchiveError::Other("checkpoint lock poisoned".into()))?;
        *data = Some(state.clone());
        Ok(())
    }
}
