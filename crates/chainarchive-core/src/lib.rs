//! chainarchive-core: crash-safe segmented archiving of ledger streams.
//!
//! # Architecture
//!
//! ```text
//! IngestBuilder → IngestionLoop
//!                      ├── Producer          (external record source)
//!                      ├── Cursor            (next position, finality lag)
//!                      ├── RetryPolicy       (bounded backoff, typed outcome)
//!                      ├── SegmentWriter     (buffer, rotate, durability barrier)
//!                      ├── CheckpointStore   (atomic JSON checkpoint)
//!                      └── MetadataSink      (best-effort notifications)
//! ```

pub mod builder;
pub mod checkpoint;
pub mod config;
pub mod cursor;
pub mod error;
pub mod ingest;
pub mod persist;
pub mod producer;
pub mod record;
pub mod retry;
pub mod segment;
pub mod shutdown;
pub mod writer;

pub use builder::IngestBuilder;
pub use checkpoint::{CheckpointState, CheckpointStore, FileCheckpointStore};
pub use config::{IngestConfig, IngestPhase};
pub use cursor::Cursor;
pub use error::{ArchiveError, ProducerError};
pub use ingest::{IngestExit, IngestStats, IngestionLoop};
pub use producer::{LogSink, MetadataSink, NoopSink, Producer};
pub use record::{AddressDelta, BlockHeader, Entity, Record, TransactionId};
pub use retry::{RetryConfig, RetryOutcome, RetryPolicy};
pub use segment::{segment_range_for, SegmentRange};
pub use shutdown::{shutdown_channel, Shutdown, ShutdownTrigger};
pub use writer::SegmentWriter;
