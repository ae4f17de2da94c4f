//! Ingestion loop: drives a producer position by position into segments.
//!
//! # Phases
//!
//! ## RESUME
//! Loads the checkpoint, truncates any segment tail written after it, and
//! positions the cursor at `last_position_written + 1`.
//!
//! ## CATCHUP
//! Queries the frontier and fetches every position up to
//! `frontier - finality_lag` (capped at `stop_position`). Records go through
//! the segment writer; every `checkpoint_every` positions (or
//! `durability_interval_ms`) the loop runs a durability barrier and then
//! saves the checkpoint, always in that order.
//!
//! ## FOLLOW
//! Caught up: sleeps `poll_interval_ms` (cancellable) and re-queries the
//! frontier.
//!
//! A transient producer failure that survives the retry policy aborts the
//! iteration: progress so far is committed, the loop cools down and goes back
//! to RESUME. Everything else is returned to the caller.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::checkpoint::{CheckpointState, CheckpointStore, FileCheckpointStore};
use crate::config::{IngestConfig, IngestPhase};
use crate::cursor::Cursor;
use crate::error::{ArchiveError, ProducerError};
use crate::producer::{notify_dirty, notify_timestamp, MetadataSink, Producer};
use crate::record::Record;
use crate::retry::{RetryOutcome, RetryPolicy};
use crate::shutdown::Shutdown;
use crate::writer::{SegmentWriter, SegmentWriterConfig};

/// Why [`IngestionLoop::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestExit {
    /// Shutdown was signalled.
    Shutdown,
    /// `stop_position` is durable.
    Completed,
}

/// Counters for observability.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub positions_processed: u64,
    pub records_written: u64,
    pub segments_rotated: u64,
    pub checkpoints_saved: u64,
    pub aborted_iterations: u64,
    pub producer_retries: u64,
    pub frontier_regressions: u64,
    pub last_frontier: Option<u64>,
}

/// Progress not yet covered by a saved checkpoint.
#[derive(Debug)]
struct Pending {
    last_position: Option<u64>,
    records: u64,
    since_barrier: u64,
    since_checkpoint: u64,
    last_checkpoint_at: Instant,
}

impl Pending {
    fn new() -> Self {
        Self {
            last_position: None,
            records: 0,
            since_barrier: 0,
            since_checkpoint: 0,
            last_checkpoint_at: Instant::now(),
        }
    }
}

/// Drives one stream from a [`Producer`] into segment files.
pub struct IngestionLoop<P: Producer> {
    config: IngestConfig,
    producer: P,
    store: Box<dyn CheckpointStore>,
    sink: Arc<dyn MetadataSink>,
    writer: SegmentWriter,
    retry: RetryPolicy,
    checkpoint: CheckpointState,
    cursor: Cursor,
    pending: Pending,
    phase: IngestPhase,
    stats: IngestStats,
}

impl<P: Producer> IngestionLoop<P> {
    pub fn new(
        config: IngestConfig,
        producer: P,
        store: Box<dyn CheckpointStore>,
        sink: Arc<dyn MetadataSink>,
    ) -> Result<Self, ArchiveError> {
        config.validate()?;
        if producer.entity() != config.entity {
            return Err(ArchiveError::Config(format!(
                "{} producer configured for the {} stream",
                producer.entity(),
                config.entity
            )));
        }

        let writer = SegmentWriter::new(SegmentWriterConfig {
            output_dir: config.output_dir.clone(),
            entity: config.entity,
            segment_size: config.segment_size,
            max_buffered_records: config.max_buffered_records,
        })?;

        Ok(Self {
            checkpoint: CheckpointState::new(
                config.entity,
                config.segment_size,
                config.start_position,
            ),
            cursor: Cursor::new(config.start_position, config.finality_lag),
            retry: RetryPolicy::new(config.retry.clone()),
            pending: Pending::new(),
            phase: IngestPhase::Idle,
            stats: IngestStats::default(),
            config,
            producer,
            store,
            sink,
            writer,
        })
    }

    /// Loop whose checkpoint lives at `config.checkpoint_path`.
    pub fn with_file_store(
        config: IngestConfig,
        producer: P,
        sink: Arc<dyn MetadataSink>,
    ) -> Result<Self, ArchiveError> {
        let store = Box::new(FileCheckpointStore::new(config.checkpoint_path.clone()));
        Self::new(config, producer, store, sink)
    }

    pub fn phase(&self) -> IngestPhase {
        self.phase
    }

    pub fn stats(&self) -> &IngestStats {
        &self.stats
    }

    /// Last saved checkpoint.
    pub fn checkpoint(&self) -> &CheckpointState {
        &self.checkpoint
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    /// Runs until shutdown, `stop_position`, or a fatal error.
    pub async fn run(&mut self, shutdown: &mut Shutdown) -> Result<IngestExit, ArchiveError> {
        tracing::info!(
            entity = %self.config.entity,
            output_dir = %self.config.output_dir.display(),
            segment_size = self.config.segment_size,
            finality_lag = self.config.finality_lag,
            "starting ingestion loop"
        );

        loop {
            self.resume().await?;

            match self.sync(shutdown).await {
                Ok(exit) => {
                    self.stop(exit).await?;
                    return Ok(exit);
                }
                Err(e) if e.is_retryable() => {
                    self.stats.aborted_iterations += 1;
                    self.commit().await?;
                    self.phase = IngestPhase::Cooldown;
                    tracing::warn!(
                        entity = %self.config.entity,
                        error = %e,
                        cooldown_ms = self.config.cooldown_ms,
                        next_position = self.cursor.next_position,
                        "iteration aborted, cooling down"
                    );
                    if !shutdown
                        .sleep(Duration::from_millis(self.config.cooldown_ms))
                        .await
                    {
                        self.stop(IngestExit::Shutdown).await?;
                        return Ok(IngestExit::Shutdown);
                    }
                }
                Err(e) => {
                    // Records of fully fetched positions are intact; only an
                    // I/O failure makes committing them unsafe.
                    if matches!(e, ArchiveError::Producer(_)) {
                        if let Err(commit_err) = self.commit().await {
                            tracing::error!(error = %commit_err, "final commit failed");
                        }
                    }
                    self.phase = IngestPhase::Stopped;
                    tracing::error!(entity = %self.config.entity, error = %e, "ingestion loop failed");
                    return Err(e);
                }
            }
        }
    }

    async fn resume(&mut self) -> Result<(), ArchiveError> {
        self.phase = IngestPhase::Resume;
        self.writer.close()?;

        let mut state = self
            .store
            .load(
                self.config.entity,
                self.config.segment_size,
                self.config.start_position,
            )
            .await?;

        if state.last_position_written.is_none() {
            // A flush can land inside a multi-record position, so the newest
            // position on disk may be short and is fetched again.
            if let Some(found) = self.writer.recover_last_position()? {
                if found > self.config.start_position {
                    let adopted = found - 1;
                    tracing::warn!(
                        entity = %self.config.entity,
                        last_position_on_disk = found,
                        adopted,
                        "checkpoint claims no progress; adopting positions found in segments"
                    );
                    state.advance(adopted, 0);
                    state.touch();
                    self.store.save(&state).await?;
                }
            }
        }

        let next = state.resume_position(self.config.start_position);
        let repair = self.writer.repair_tail(next)?;

        tracing::info!(
            entity = %self.config.entity,
            last_position_written = ?state.last_position_written,
            next_position = next,
            truncated_segments = repair.files_truncated,
            "resuming from checkpoint"
        );

        self.cursor.next_position = next;
        self.checkpoint = state;
        self.pending = Pending::new();
        Ok(())
    }

    async fn sync(&mut self, shutdown: &mut Shutdown) -> Result<IngestExit, ArchiveError> {
        loop {
            if shutdown.is_triggered() {
                return Ok(IngestExit::Shutdown);
            }
            if let Some(stop) = self.config.stop_position {
                if self.cursor.next_position > stop {
                    return Ok(IngestExit::Completed);
                }
            }

            let mut calls = 0u64;
            let outcome = {
                let producer = &self.producer;
                let calls = &mut calls;
                self.retry
                    .run("current_frontier", shutdown, move || {
                        *calls += 1;
                        producer.current_frontier()
                    })
                    .await
            };
            self.stats.producer_retries += calls.saturating_sub(1);
            let frontier = match outcome {
                RetryOutcome::Done(frontier) => frontier,
                RetryOutcome::Cancelled => return Ok(IngestExit::Shutdown),
                RetryOutcome::Exhausted { last, .. } | RetryOutcome::Fatal(last) => {
                    return Err(last.into())
                }
            };
            self.observe_frontier(frontier);

            let target = self
                .cursor
                .eligible_frontier(frontier)
                .map(|t| self.config.stop_position.map_or(t, |stop| t.min(stop)))
                .filter(|t| *t >= self.cursor.next_position);

            let Some(target) = target else {
                self.commit().await?;
                if self.phase != IngestPhase::Follow {
                    tracing::info!(
                        entity = %self.config.entity,
                        frontier,
                        next_position = self.cursor.next_position,
                        "caught up, following frontier"
                    );
                    self.phase = IngestPhase::Follow;
                }
                if !shutdown
                    .sleep(Duration::from_millis(self.config.poll_interval_ms))
                    .await
                {
                    return Ok(IngestExit::Shutdown);
                }
                continue;
            };

            if self.phase != IngestPhase::Catchup {
                tracing::info!(
                    entity = %self.config.entity,
                    from = self.cursor.next_position,
                    to = target,
                    frontier,
                    "catching up"
                );
                self.phase = IngestPhase::Catchup;
            }

            let mut position = self.cursor.next_position;
            while position <= target {
                if shutdown.is_triggered() {
                    return Ok(IngestExit::Shutdown);
                }

                let mut calls = 0u64;
                let outcome = {
                    let producer = &self.producer;
                    let calls = &mut calls;
                    self.retry
                        .run("fetch", shutdown, move || {
                            *calls += 1;
                            producer.fetch(position)
                        })
                        .await
                };
                self.stats.producer_retries += calls.saturating_sub(1);
                let records = match outcome {
                    RetryOutcome::Done(records) => records,
                    RetryOutcome::Cancelled => return Ok(IngestExit::Shutdown),
                    RetryOutcome::Exhausted { last, .. } | RetryOutcome::Fatal(last) => {
                        return Err(last.into())
                    }
                };

                self.write_position(position, &records).await?;
                self.cursor.advance(position);
                self.maybe_checkpoint().await?;
                position += 1;
            }
        }
    }

    fn observe_frontier(&mut self, frontier: u64) {
        self.stats.last_frontier = Some(frontier);
        let Some(regression) = self.cursor.observe_frontier(frontier) else {
            return;
        };
        self.stats.frontier_regressions += 1;

        let written = self
            .pending
            .last_position
            .or(self.checkpoint.last_position_written);
        match written {
            Some(last) if regression.current < last => tracing::error!(
                entity = %self.config.entity,
                previous = regression.previous,
                current = regression.current,
                last_position_written = last,
                "frontier dropped below written positions; records past it may be stale"
            ),
            _ => tracing::warn!(
                entity = %self.config.entity,
                previous = regression.previous,
                current = regression.current,
                "producer frontier went backwards"
            ),
        }
    }

    async fn write_position(&mut self, position: u64, records: &[Record]) -> Result<(), ArchiveError> {
        // Check the whole position before writing any of it.
        for record in records {
            if record.entity() != self.config.entity || record.position() != position {
                return Err(ProducerError::Fatal(format!(
                    "producer returned a {} record at position {} for {} position {position}",
                    record.entity(),
                    record.position(),
                    self.config.entity
                ))
                .into());
            }
            record.validate()?;
        }

        for record in records {
            if let Some(rotation) = self.writer.write(position, record)? {
                if rotation.closed.is_some() {
                    self.stats.segments_rotated += 1;
                    let key = format!("{}:segments", self.config.entity);
                    notify_dirty(self.sink.as_ref(), &key).await;
                }
            }
        }

        self.pending.last_position = Some(position);
        self.pending.records += records.len() as u64;
        self.pending.since_barrier += 1;
        self.pending.since_checkpoint += 1;
        self.stats.positions_processed += 1;
        self.stats.records_written += records.len() as u64;
        tracing::debug!(entity = %self.config.entity, position, records = records.len(), "position written");
        Ok(())
    }

    async fn maybe_checkpoint(&mut self) -> Result<(), ArchiveError> {
        let interval = Duration::from_millis(self.config.durability_interval_ms);
        if self.pending.since_checkpoint >= self.config.checkpoint_every
            || self.pending.last_checkpoint_at.elapsed() >= interval
        {
            self.commit().await
        } else if self.pending.since_barrier >= self.config.fsync_every {
            self.writer.durability_barrier()?;
            self.pending.since_barrier = 0;
            Ok(())
        } else {
            Ok(())
        }
    }

    /// Durability barrier, then checkpoint save. No-op without new positions.
    async fn commit(&mut self) -> Result<(), ArchiveError> {
        let Some(position) = self.pending.last_position else {
            return Ok(());
        };

        self.writer.durability_barrier()?;
        let mut next = self.checkpoint.clone();
        next.advance(position, self.pending.records);
        next.touch();
        self.store.save(&next).await?;
        self.checkpoint = next;

        self.pending = Pending::new();
        self.stats.checkpoints_saved += 1;
        tracing::info!(
            entity = %self.config.entity,
            last_position_written = position,
            records_written_total = self.checkpoint.records_written_total,
            "checkpoint saved"
        );

        let key = format!("{}:checkpoint", self.config.entity);
        notify_timestamp(self.sink.as_ref(), &key).await;
        Ok(())
    }

    async fn stop(&mut self, exit: IngestExit) -> Result<(), ArchiveError> {
        self.phase = IngestPhase::Stopping;
        self.commit().await?;
        self.writer.close()?;
        self.phase = IngestPhase::Stopped;
        tracing::info!(
            entity = %self.config.entity,
            reason = ?exit,
            last_position_written = ?self.checkpoint.last_position_written,
            "ingestion loop stopped"
        );
        Ok(())
    }
}
