//! Shard index builder: turns segment records into sitemap shards.
//!
//! The builder reads segment files in position order from the saved
//! `(source_file, source_offset)`, renders one `<url>` entry per new key and
//! commits them in batches:
//!
//! 1. rotate to a new shard whenever the current one holds
//!    `max_urls_per_shard` entries;
//! 2. close the shard (footer written back, fsynced);
//! 3. save [`ShardIndexState`] with the new offset;
//! 4. rebuild the root index if a shard was created.
//!
//! A crash before step 3 leaves the shards ahead of the state. On open the
//! builder notices, corrects its counters and reloads the replay ring from
//! the shard tails, so the re-read batch is not emitted twice.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chainarchive_core::checkpoint::read_checkpoint;
use chainarchive_core::error::{io_at, ArchiveError};
use chainarchive_core::producer::{notify_dirty, notify_timestamp, MetadataSink};
use chainarchive_core::record::Record;
use chainarchive_core::segment::{list_segment_files, SegmentFile};
use chainarchive_core::shutdown::Shutdown;

use crate::config::SitemapConfig;
use crate::index::rebuild_root_index;
use crate::layout::ShardLayout;
use crate::replay::ReplayGuard;
use crate::shard::{read_locs, validate_shard, ShardWriter};
use crate::state::ShardIndexState;

/// Counters for observability.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildStats {
    pub lines_read: u64,
    pub entries_written: u64,
    pub skipped_malformed: u64,
    pub skipped_replayed: u64,
    pub commits: u64,
    pub shards_created: u64,
}

/// How one pass over a segment file ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DrainEnd {
    /// Every byte of the file is consumed.
    EndOfFile,
    /// A trailing line has no newline yet.
    PartialLine,
    /// The next record is not covered by the ingest checkpoint.
    Watermark,
}

#[derive(Debug, Clone, Copy)]
struct Drain {
    lines: u64,
    end: DrainEnd,
}

pub struct ShardIndexBuilder {
    config: SitemapConfig,
    layout: ShardLayout,
    state: ShardIndexState,
    guard: ReplayGuard,
    sink: Arc<dyn MetadataSink>,
    stats: BuildStats,
    last_heartbeat: Instant,
}

impl ShardIndexBuilder {
    /// Loads state, reconciles it with the shards on disk and rebuilds the
    /// root index.
    pub fn open(config: SitemapConfig, sink: Arc<dyn MetadataSink>) -> Result<Self, ArchiveError> {
        config.validate()?;
        let layout = config.layout();
        fs::create_dir_all(layout.dir()).map_err(io_at(layout.dir()))?;

        let state = ShardIndexState::load(&config.state_path)?;
        let guard = ReplayGuard::from_keys(config.replay_ring_size, state.replay_ring.clone());

        let mut builder = Self {
            config,
            layout,
            state,
            guard,
            sink,
            stats: BuildStats::default(),
            last_heartbeat: Instant::now(),
        };
        builder.reconcile()?;
        builder.rebuild_index()?;

        tracing::info!(
            family = %builder.config.name,
            source_file = ?builder.state.source_file,
            offset = builder.state.source_offset,
            shard_index = builder.state.shard_index,
            urls_in_shard = builder.state.urls_in_shard,
            written_total = builder.state.written_total,
            "sitemap builder opened"
        );
        Ok(builder)
    }

    pub fn state(&self) -> &ShardIndexState {
        &self.state
    }

    pub fn stats(&self) -> &BuildStats {
        &self.stats
    }

    pub fn config(&self) -> &SitemapConfig {
        &self.config
    }

    /// Rewrites the root index from the shards on disk.
    pub fn rebuild_index(&self) -> Result<usize, ArchiveError> {
        rebuild_root_index(
            &self.config.root_index_path,
            &self.layout,
            &self.config.shard_base_url,
            &self.config.extra_index_locs,
        )
    }

    /// Brings the state in line with shards written after its last save.
    fn reconcile(&mut self) -> Result<(), ArchiveError> {
        let shards = self.layout.list_shards()?;
        let recorded = self.state.shard_index;
        let current = shards
            .last()
            .map_or(recorded, |s| s.index.max(recorded));

        // Opening repairs a shard left without its footer.
        drop(ShardWriter::open_for_append(&self.layout, current)?);

        let mut on_disk_since_recorded = 0u64;
        let mut in_current = 0u64;
        for shard in shards.iter().filter(|s| s.index >= recorded) {
            let entries = validate_shard(&shard.path)?.entries as u64;
            on_disk_since_recorded += entries;
            if shard.index == current {
                in_current = entries;
            }
        }

        if current == recorded && in_current == self.state.urls_in_shard {
            return Ok(());
        }

        let ahead = on_disk_since_recorded.saturating_sub(self.state.urls_in_shard);
        let behind = self.state.urls_in_shard.saturating_sub(on_disk_since_recorded);
        tracing::warn!(
            family = %self.config.name,
            recorded_shard = recorded,
            recorded_urls = self.state.urls_in_shard,
            disk_shard = current,
            disk_urls = in_current,
            "sitemap state out of step with shards on disk, reconciling"
        );

        self.state.shard_index = current;
        self.state.urls_in_shard = in_current;
        self.state.written_total = (self.state.written_total + ahead).saturating_sub(behind);

        if ahead > 0 && self.guard.is_enabled() {
            self.reload_guard_from_disk()?;
        }
        self.state.replay_ring = self.guard.keys();
        self.state.touch();
        self.state.save(&self.config.state_path)
    }

    /// Refills the replay ring with the newest keys present in the shards.
    fn reload_guard_from_disk(&mut self) -> Result<(), ArchiveError> {
        let capacity = self.config.replay_ring_size;
        let mut newest_first: Vec<String> = Vec::new();

        for shard in self.layout.list_shards()?.iter().rev() {
            let locs = read_locs(&shard.path)?;
            for loc in locs.iter().rev() {
                if let Some(key) = self.config.url.key_from_loc(loc) {
                    newest_first.push(key.to_string());
                }
                if newest_first.len() >= capacity {
                    break;
                }
            }
            if newest_first.len() >= capacity {
                break;
            }
        }

        newest_first.reverse();
        tracing::info!(
            family = %self.config.name,
            keys = newest_first.len(),
            "replay ring reloaded from shards"
        );
        self.guard = ReplayGuard::from_keys(capacity, newest_first);
        Ok(())
    }

    /// Runs until shutdown. Sleeps `poll_interval_ms` whenever a pass finds
    /// nothing new.
    pub async fn run(&mut self, shutdown: &mut Shutdown) -> Result<(), ArchiveError> {
        let poll = Duration::from_millis(self.config.poll_interval_ms);
        tracing::info!(
            family = %self.config.name,
            segments_dir = %self.config.segments_dir.display(),
            "starting sitemap builder"
        );

        loop {
            if shutdown.is_triggered() {
                break;
            }
            let progressed = self.run_once().await?;
            if !progressed && !shutdown.sleep(poll).await {
                break;
            }
        }

        tracing::info!(
            family = %self.config.name,
            written_total = self.state.written_total,
            shard_index = self.state.shard_index,
            "sitemap builder stopped"
        );
        Ok(())
    }

    /// One pass: drains the current segment file and moves on to the next
    /// one when it is finished. Returns whether anything was consumed.
    pub async fn run_once(&mut self) -> Result<bool, ArchiveError> {
        let files = list_segment_files(&self.config.segments_dir, self.config.entity.as_str())?;
        if files.is_empty() {
            return Ok(false);
        }

        let (at, switched) = match self.state.source_file.as_deref() {
            None => (0, true),
            Some(name) => match files.iter().position(|f| f.name == name) {
                Some(at) => (at, false),
                None => match files.iter().position(|f| f.name.as_str() > name) {
                    Some(at) => {
                        tracing::warn!(
                            family = %self.config.name,
                            missing = name,
                            next = %files[at].name,
                            "source segment disappeared, moving to the next one"
                        );
                        (at, true)
                    }
                    None => {
                        tracing::warn!(
                            family = %self.config.name,
                            missing = name,
                            "source segment disappeared and nothing follows it"
                        );
                        return Ok(false);
                    }
                },
            },
        };
        if switched {
            self.switch_to(&files[at])?;
        }

        let watermark = self.watermark();
        let mut drain = self.drain(&files[at], watermark).await?;
        let mut progressed = switched || drain.lines > 0;

        if let Some(next) = files.get(at + 1) {
            // The writer may have appended to this file just before rotating.
            if drain.end == DrainEnd::EndOfFile {
                drain = self.drain(&files[at], watermark).await?;
                progressed |= drain.lines > 0;
            }
            if drain.end == DrainEnd::EndOfFile {
                tracing::info!(
                    family = %self.config.name,
                    finished = %files[at].name,
                    next = %next.name,
                    "advancing to next segment"
                );
                self.switch_to(next)?;
                progressed = true;
            }
        }
        Ok(progressed)
    }

    fn switch_to(&mut self, file: &SegmentFile) -> Result<(), ArchiveError> {
        self.state.source_file = Some(file.name.clone());
        self.state.source_offset = 0;
        self.state.touch();
        self.state.save(&self.config.state_path)
    }

    /// Highest position the builder may index. `None` when nothing is
    /// committed yet.
    fn watermark(&self) -> Option<u64> {
        let Some(path) = self.config.checkpoint_path.as_deref() else {
            return Some(u64::MAX);
        };
        match read_checkpoint(path) {
            Ok(Some(checkpoint)) => checkpoint.last_position_written,
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(
                    family = %self.config.name,
                    checkpoint = %path.display(),
                    error = %e,
                    "ingest checkpoint unreadable, indexing nothing this pass"
                );
                None
            }
        }
    }

    async fn drain(&mut self, file: &SegmentFile, watermark: Option<u64>) -> Result<Drain, ArchiveError> {
        let path = &file.path;
        let len = match fs::metadata(path) {
            Ok(meta) => meta.len(),
            // Rotated away between listing and reading.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Drain {
                    lines: 0,
                    end: DrainEnd::PartialLine,
                })
            }
            Err(e) => return Err(ArchiveError::io(path, e)),
        };

        if self.state.source_offset > len {
            tracing::warn!(
                family = %self.config.name,
                segment = %file.name,
                offset = self.state.source_offset,
                file_len = len,
                "saved offset is past the end of the segment, clamping"
            );
            self.state.source_offset = len;
            self.state.touch();
            self.state.save(&self.config.state_path)?;
        }

        let mut reader = BufReader::new(File::open(path).map_err(io_at(path))?);
        reader
            .seek(SeekFrom::Start(self.state.source_offset))
            .map_err(io_at(path))?;

        let entity = self.config.entity;
        let mut offset = self.state.source_offset;
        let mut batch: Vec<String> = Vec::new();
        let mut lines = 0u64;
        let mut line = Vec::new();

        let end = loop {
            line.clear();
            let n = reader.read_until(b'\n', &mut line).map_err(io_at(path))?;
            if n == 0 {
                break DrainEnd::EndOfFile;
            }
            if line.last() != Some(&b'\n') {
                break DrainEnd::PartialLine;
            }

            match Record::parse_line(entity, &line) {
                Ok(record) => {
                    if watermark.map_or(true, |w| record.position() > w) {
                        break DrainEnd::Watermark;
                    }
                    let key = record.key();
                    if self.guard.contains(&key) {
                        self.stats.skipped_replayed += 1;
                        tracing::debug!(family = %self.config.name, key = %key, "key already emitted, skipping");
                    } else {
                        batch.push(self.config.url.render(&key));
                        self.guard.remember(key);
                    }
                }
                Err(e) => {
                    self.stats.skipped_malformed += 1;
                    tracing::warn!(
                        family = %self.config.name,
                        segment = %file.name,
                        offset,
                        error = %e,
                        "skipping malformed line"
                    );
                }
            }

            offset += n as u64;
            lines += 1;
            self.stats.lines_read += 1;

            if batch.len() >= self.config.batch_size {
                self.commit(&file.name, offset, std::mem::take(&mut batch)).await?;
            }
        };

        if !batch.is_empty() {
            self.commit(&file.name, offset, batch).await?;
        } else if offset != self.state.source_offset {
            // Only skipped lines since the last commit.
            self.state.source_offset = offset;
            self.state.replay_ring = self.guard.keys();
            self.state.touch();
            self.state.save(&self.config.state_path)?;
        }

        Ok(Drain { lines, end })
    }

    async fn commit(
        &mut self,
        source_file: &str,
        offset: u64,
        entries: Vec<String>,
    ) -> Result<(), ArchiveError> {
        let count = entries.len() as u64;
        let mut writer = ShardWriter::open_for_append(&self.layout, self.state.shard_index)?;
        let mut created = writer.created();
        let mut rotated = false;

        for entry in &entries {
            if self.state.urls_in_shard >= self.config.max_urls_per_shard {
                writer.close()?;
                let full = self.state.shard_index;
                self.state.shard_index += 1;
                self.state.urls_in_shard = 0;
                writer = ShardWriter::open_for_append(&self.layout, self.state.shard_index)?;
                created |= writer.created();
                rotated = true;
                self.stats.shards_created += 1;
                tracing::info!(
                    family = %self.config.name,
                    full_shard = full,
                    shard_index = self.state.shard_index,
                    "shard rotated"
                );
            }
            writer.append_entry(entry);
            self.state.urls_in_shard += 1;
            self.state.written_total += 1;
        }
        writer.close()?;

        self.state.source_file = Some(source_file.to_string());
        self.state.source_offset = offset;
        self.state.replay_ring = self.guard.keys();
        self.state.touch();
        self.state.save(&self.config.state_path)?;

        self.stats.entries_written += count;
        self.stats.commits += 1;
        tracing::debug!(
            family = %self.config.name,
            entries = count,
            offset,
            shard_index = self.state.shard_index,
            "sitemap batch committed"
        );

        if created {
            self.rebuild_index()?;
        }
        if rotated {
            notify_dirty(self.sink.as_ref(), &format!("{}:shards", self.config.name)).await;
        }
        notify_timestamp(self.sink.as_ref(), &format!("{}:last_build", self.config.name)).await;
        self.heartbeat(source_file);
        Ok(())
    }

    fn heartbeat(&mut self, source_file: &str) {
        let interval = Duration::from_millis(self.config.heartbeat_interval_ms);
        if self.last_heartbeat.elapsed() < interval {
            return;
        }
        self.last_heartbeat = Instant::now();
        tracing::info!(
            family = %self.config.name,
            segment = source_file,
            offset = self.state.source_offset,
            shard_index = self.state.shard_index,
            urls_in_shard = self.state.urls_in_shard,
            written_total = self.state.written_total,
            "sitemap builder heartbeat"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainarchive_core::producer::{MemorySink, NoopSink, SinkCall};
    use chainarchive_core::record::{BlockHeader, Entity};
    use std::io::Write;
    use std::path::Path;

    fn block_line(height: u64) -> String {
        Record::from(BlockHeader {
            height,
            hash: format!("{height:064x}"),
            time: 0,
        })
        .to_line()
        .unwrap()
    }

    fn config(root: &Path) -> SitemapConfig {
        let mut cfg = SitemapConfig::for_entity("blocks", Entity::Blocks, "https://x.test/block/");
        cfg.segments_dir = root.join("segments");
        cfg.checkpoint_path = None;
        cfg.shards_dir = root.join("shards");
        cfg.state_path = root.join("state.json");
        cfg.root_index_path = root.join("sitemap.xml");
        cfg.shard_base_url = "https://x.test/sitemaps/".into();
        cfg.max_urls_per_shard = 4;
        cfg.batch_size = 3;
        cfg.poll_interval_ms = 5;
        cfg
    }

    fn write_segment(root: &Path, name: &str, body: &str) {
        let dir = root.join("segments");
        fs::create_dir_all(&dir).unwrap();
        let mut f = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(name))
            .unwrap();
        f.write_all(body.as_bytes()).unwrap();
    }

    fn lines(heights: std::ops::RangeInclusive<u64>) -> String {
        heights.map(|h| block_line(h) + "\n").collect()
    }

    #[tokio::test]
    async fn partial_line_waits_for_newline() {
        let dir = tempfile::tempdir().unwrap();
        let full = block_line(1);
        let (head, tail) = full.split_at(10);
        write_segment(dir.path(), "blocks_000000000_000000009.jsonl", &(block_line(0) + "\n" + head));

        let mut builder = ShardIndexBuilder::open(config(dir.path()), Arc::new(NoopSink)).unwrap();
        builder.run_once().await.unwrap();
        assert_eq!(builder.state().written_total, 1);
        let consumed = builder.state().source_offset;
        assert_eq!(consumed, block_line(0).len() as u64 + 1);

        write_segment(dir.path(), "blocks_000000000_000000009.jsonl", &format!("{tail}\n"));
        builder.run_once().await.unwrap();
        assert_eq!(builder.state().written_total, 2);
    }

    #[tokio::test]
    async fn malformed_lines_are_skipped_and_offset_persisted() {
        let dir = tempfile::tempdir().unwrap();
        write_segment(
            dir.path(),
            "blocks_000000000_000000009.jsonl",
            &format!("{}not json\n{{\"height\":1}}\n", lines(0..=0)),
        );

        let mut builder = ShardIndexBuilder::open(config(dir.path()), Arc::new(NoopSink)).unwrap();
        builder.run_once().await.unwrap();
        assert_eq!(builder.stats().skipped_malformed, 2);
        assert_eq!(builder.state().written_total, 1);

        let len = fs::metadata(dir.path().join("segments/blocks_000000000_000000009.jsonl"))
            .unwrap()
            .len();
        let saved = ShardIndexState::read(&dir.path().join("state.json")).unwrap().unwrap();
        assert_eq!(saved.source_offset, len);
    }

    #[tokio::test]
    async fn watermark_limits_indexing_to_checkpointed_positions() {
        let dir = tempfile::tempdir().unwrap();
        write_segment(dir.path(), "blocks_000000000_000000009.jsonl", &lines(0..=5));
        let mut cfg = config(dir.path());
        let checkpoint = dir.path().join("checkpoint.json");
        cfg.checkpoint_path = Some(checkpoint.clone());

        let mut builder = ShardIndexBuilder::open(cfg, Arc::new(NoopSink)).unwrap();
        // No checkpoint yet: nothing is committed, nothing is indexed.
        builder.run_once().await.unwrap();
        assert_eq!(builder.state().written_total, 0);
        assert_eq!(builder.state().source_offset, 0);

        let mut state = chainarchive_core::CheckpointState::new(Entity::Blocks, 10, 0);
        state.advance(3, 4);
        chainarchive_core::persist::write_json_atomic(&checkpoint, &state).unwrap();
        builder.run_once().await.unwrap();
        assert_eq!(builder.state().written_total, 4);

        state.advance(5, 2);
        chainarchive_core::persist::write_json_atomic(&checkpoint, &state).unwrap();
        builder.run_once().await.unwrap();
        assert_eq!(builder.state().written_total, 6);
    }

    #[tokio::test]
    async fn rotation_notifies_sink_and_lists_new_shard() {
        let dir = tempfile::tempdir().unwrap();
        write_segment(dir.path(), "blocks_000000000_000000009.jsonl", &lines(0..=4));
        let sink = Arc::new(MemorySink::new());

        let mut builder = ShardIndexBuilder::open(config(dir.path()), sink.clone()).unwrap();
        builder.run_once().await.unwrap();

        assert_eq!(builder.state().shard_index, 2);
        assert_eq!(builder.state().urls_in_shard, 1);
        assert_eq!(builder.stats().shards_created, 1);
        let calls = sink.calls();
        assert!(calls.contains(&SinkCall::Dirty("blocks:shards".into())));
        assert!(calls.contains(&SinkCall::Timestamp("blocks:last_build".into())));

        let index = fs::read_to_string(dir.path().join("sitemap.xml")).unwrap();
        assert!(index.contains("https://x.test/sitemaps/sitemap_blocks_000002.xml"));
    }

    #[tokio::test]
    async fn offset_past_end_is_clamped() {
        let dir = tempfile::tempdir().unwrap();
        write_segment(dir.path(), "blocks_000000000_000000009.jsonl", &lines(0..=1));
        let len = fs::metadata(dir.path().join("segments/blocks_000000000_000000009.jsonl"))
            .unwrap()
            .len();
        let state = ShardIndexState {
            source_file: Some("blocks_000000000_000000009.jsonl".into()),
            source_offset: len + 500,
            ..ShardIndexState::default()
        };
        state.save(&dir.path().join("state.json")).unwrap();

        let mut builder = ShardIndexBuilder::open(config(dir.path()), Arc::new(NoopSink)).unwrap();
        builder.run_once().await.unwrap();
        assert_eq!(builder.state().source_offset, len);
        assert_eq!(builder.state().written_total, 0);
    }
}
