//! Fluent builder API for ingestion streams.
//!
//! # Example
//!
//! ```rust
//! use chainarchive_core::builder::IngestBuilder;
//! use chainarchive_core::record::Entity;
//!
//! let config = IngestBuilder::new(Entity::Txids)
//!     .output_dir("/var/lib/archive/txids")
//!     .checkpoint_path("/var/lib/archive/state/txids.json")
//!     .segment_size(10_000)
//!     .finality_lag(2)
//!     .build_config()
//!     .unwrap();
//! assert_eq!(config.segment_size, 10_000);
//! ```

use std::path::PathBuf;

use crate::config::IngestConfig;
use crate::error::ArchiveError;
use crate::record::Entity;
use crate::retry::RetryConfig;

/// Fluent builder for [`IngestConfig`].
pub struct IngestBuilder {
    config: IngestConfig,
}

impl IngestBuilder {
    pub fn new(entity: Entity) -> Self {
        Self {
            config: IngestConfig::for_entity(entity),
        }
    }

    /// Set the directory receiving segment files.
    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.output_dir = dir.into();
        self
    }

    /// Set the checkpoint document path.
    pub fn checkpoint_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.checkpoint_path = path.into();
        self
    }

    /// Set the number of positions per segment.
    pub fn segment_size(mut self, size: u64) -> Self {
        self.config.segment_size = size;
        self
    }

    /// Set the first position ingested when no checkpoint exists.
    pub fn start_position(mut self, position: u64) -> Self {
        self.config.start_position = position;
        self
    }

    /// Stop after this position is durable (bounded backfill).
    pub fn stop_position(mut self, position: u64) -> Self {
        self.config.stop_position = Some(position);
        self
    }

    /// Set the finality lag (positions behind the frontier before processing).
    pub fn finality_lag(mut self, lag: u64) -> Self {
        self.config.finality_lag = lag;
        self
    }

    /// Set checkpoint save interval (every N positions).
    pub fn checkpoint_every(mut self, n: u64) -> Self {
        self.config.checkpoint_every = n;
        self
    }

    /// Set the durability barrier interval (every N positions).
    pub fn fsync_every(mut self, n: u64) -> Self {
        self.config.fsync_every = n;
        self
    }

    /// Set the buffered record count that forces a flush.
    pub fn max_buffered_records(mut self, n: usize) -> Self {
        self.config.max_buffered_records = n;
        self
    }

    /// Set follow mode polling interval in milliseconds.
    pub fn poll_interval_ms(mut self, ms: u64) -> Self {
        self.config.poll_interval_ms = ms;
        self
    }

    /// Set the pause after an aborted iteration, in milliseconds.
    pub fn cooldown_ms(mut self, ms: u64) -> Self {
        self.config.cooldown_ms = ms;
        self
    }

    /// Set the producer retry policy.
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.config.retry = retry;
        self
    }

    /// Build and validate the [`IngestConfig`].
    pub fn build_config(self) -> Result<IngestConfig, ArchiveError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
