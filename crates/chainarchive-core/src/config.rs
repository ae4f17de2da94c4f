//! Ingestion configuration and runtime phase.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::ArchiveError;
use crate::record::Entity;
use crate::retry::RetryConfig;

/// Configuration for one ingestion stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Stream to ingest; also the segment file prefix.
    pub entity: Entity,
    /// Directory receiving the segment files.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Checkpoint JSON document.
    #[serde(default = "default_checkpoint_path")]
    pub checkpoint_path: PathBuf,
    /// Positions per segment. Fixed for the lifetime of the stream.
    #[serde(default = "default_segment_size")]
    pub segment_size: u64,
    /// First position to ingest when no checkpoint exists.
    #[serde(default)]
    pub start_position: u64,
    /// Optional last position (for bounded backfill). `None` = run forever.
    #[serde(default)]
    pub stop_position: Option<u64>,
    /// Positions newer than `frontier - finality_lag` are withheld.
    #[serde(default = "default_finality_lag")]
    pub finality_lag: u64,
    /// Save a checkpoint every N positions.
    #[serde(default = "default_every")]
    pub checkpoint_every: u64,
    /// Run a durability barrier every N positions.
    #[serde(default = "default_every")]
    pub fsync_every: u64,
    /// Also checkpoint when this much time passed since the last one.
    #[serde(default = "default_durability_interval_ms")]
    pub durability_interval_ms: u64,
    /// Buffered records that force a flush.
    #[serde(default = "default_max_buffered_records")]
    pub max_buffered_records: usize,
    /// Sleep between frontier polls once caught up (milliseconds).
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Pause after an aborted iteration before resuming (milliseconds).
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("data/segments")
}

fn default_checkpoint_path() -> PathBuf {
    PathBuf::from("data/checkpoint.json")
}

fn default_segment_size() -> u64 {
    10_000
}

fn default_finality_lag() -> u64 {
    2
}

fn default_every() -> u64 {
    100
}

fn default_durability_interval_ms() -> u64 {
    5_000
}

fn default_max_buffered_records() -> usize {
    250_000
}

fn default_poll_interval_ms() -> u64 {
    10_000
}

fn default_cooldown_ms() -> u64 {
    5_000
}

impl IngestConfig {
    /// Defaults for `entity`, with files under `data/{entity}/`.
    pub fn for_entity(entity: Entity) -> Self {
        let base = PathBuf::from("data").join(entity.as_str());
        Self {
            entity,
            output_dir: base.join("segments"),
            checkpoint_path: base.join("checkpoint.json"),
            segment_size: default_segment_size(),
            start_position: 0,
            stop_position: None,
            finality_lag: default_finality_lag(),
            checkpoint_every: default_every(),
            fsync_every: default_every(),
            durability_interval_ms: default_durability_interval_ms(),
            max_buffered_records: default_max_buffered_records(),
            poll_interval_ms: default_poll_interval_ms(),
            cooldown_ms: default_cooldown_ms(),
            retry: RetryConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<(), ArchiveError> {
        let invalid = |what: &str| {
            Err(ArchiveError::Config(format!(
                "{} stream: {what} must be positive",
                self.entity
            )))
        };
        if self.segment_size == 0 {
            return invalid("segment_size");
        }
        if self.checkpoint_every == 0 {
            return invalid("checkpoint_every");
        }
        if self.fsync_every == 0 {
            return invalid("fsync_every");
        }
        if self.max_buffered_records == 0 {
            return invalid("max_buffered_records");
        }
        if let Some(stop) = self.stop_position {
            if stop < self.start_position {
                return Err(ArchiveError::Config(format!(
                    "{} stream: stop_position {stop} is before start_position {}",
                    self.entity, self.start_position
                )));
            }
        }
        Ok(())
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self::for_entity(Entity::Blocks)
    }
}

/// Runtime phase of an ingestion loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IngestPhase {
    /// Not yet started.
    Idle,
    /// Loading the checkpoint and repairing segment tails.
    Resume,
    /// Fetching positions up to the eligible frontier.
    Catchup,
    /// Caught up; polling the frontier.
    Follow,
    /// Waiting out the cooldown after an aborted iteration.
    Cooldown,
    /// Final barrier and checkpoint before exit.
    Stopping,
    /// Terminated.
    Stopped,
}

impl std::fmt::Display for IngestPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Resume => write!(f, "resume"),
            Self::Catchup => write!(f, "catchup"),
            Self::Follow => write!(f, "follow"),
            Self::Cooldown => write!(f, "cooldown"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}
