//! Crash and resume behaviour of the ingestion loop against real files.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use chainarchive_core::checkpoint::read_checkpoint;
use chainarchive_core::producer::MemoryProducer;
use chainarchive_core::segment::list_segment_files;
use chainarchive_core::{
    shutdown_channel, Entity, IngestBuilder, IngestConfig, IngestExit, IngestionLoop, LogSink,
    NoopSink, Record, RetryConfig, TransactionId,
};

fn config(root: &Path, segment_size: u64, stop: u64) -> IngestConfig {
    IngestBuilder::new(Entity::Blocks)
        .output_dir(root.join("segments"))
        .checkpoint_path(root.join("state/blocks.json"))
        .segment_size(segment_size)
        .finality_lag(0)
        .checkpoint_every(7)
        .fsync_every(3)
        .stop_position(stop)
        .poll_interval_ms(5)
        .cooldown_ms(1)
        .retry(RetryConfig {
            max_retries: 1,
            initial_backoff_ms: 1,
            max_backoff_ms: 1,
            multiplier: 1.0,
        })
        .build_config()
        .unwrap()
}

async fn run_to(root: &Path, segment_size: u64, stop: u64, frontier: u64) -> IngestExit {
    let (_trigger, mut shutdown) = shutdown_channel();
    let mut ingest = IngestionLoop::with_file_store(
        config(root, segment_size, stop),
        MemoryProducer::blocks(0, frontier),
        Arc::new(NoopSink),
    )
    .unwrap();
    ingest.run(&mut shutdown).await.unwrap()
}

/// Segment file name → file bytes.
fn snapshot(root: &Path) -> BTreeMap<String, Vec<u8>> {
    list_segment_files(&root.join("segments"), "blocks")
        .unwrap()
        .into_iter()
        .map(|f| (f.name, fs::read(f.path).unwrap()))
        .collect()
}

fn positions(root: &Path) -> Vec<u64> {
    list_segment_files(&root.join("segments"), "blocks")
        .unwrap()
        .into_iter()
        .flat_map(|f| {
            fs::read_to_string(f.path)
                .unwrap()
                .lines()
                .map(|l| Record::parse_line(Entity::Blocks, l.as_bytes()).unwrap().position())
                .collect::<Vec<_>>()
        })
        .collect()
}

#[tokio::test]
async fn ten_thousand_and_six_positions_span_two_segments() {
    let dir = tempfile::tempdir().unwrap();
    let exit = run_to(dir.path(), 10_000, 10_005, 20_000).await;
    assert_eq!(exit, IngestExit::Completed);

    let files = snapshot(dir.path());
    let names: Vec<_> = files.keys().cloned().collect();
    assert_eq!(
        names,
        [
            "blocks_000000000_000009999.jsonl",
            "blocks_000010000_000019999.jsonl"
        ]
    );
    let count = |name: &str| files[name].iter().filter(|b| **b == b'\n').count();
    assert_eq!(count("blocks_000000000_000009999.jsonl"), 10_000);
    assert_eq!(count("blocks_000010000_000019999.jsonl"), 6);

    let checkpoint = read_checkpoint(&dir.path().join("state/blocks.json"))
        .unwrap()
        .unwrap();
    assert_eq!(checkpoint.last_position_written, Some(10_005));
    assert_eq!(checkpoint.current_segment_start, 10_000);
    assert_eq!(checkpoint.current_segment_end, 19_999);
    assert_eq!(checkpoint.records_written_total, 10_006);
}

#[tokio::test]
async fn resumed_run_matches_uninterrupted_run() {
    let resumed = tempfile::tempdir().unwrap();
    run_to(resumed.path(), 25, 49, 200).await;
    let checkpoint = read_checkpoint(&resumed.path().join("state/blocks.json"))
        .unwrap()
        .unwrap();
    assert_eq!(checkpoint.resume_position(0), 50);
    run_to(resumed.path(), 25, 99, 200).await;

    let straight = tempfile::tempdir().unwrap();
    run_to(straight.path(), 25, 99, 200).await;

    assert_eq!(snapshot(resumed.path()), snapshot(straight.path()));
    assert_eq!(positions(resumed.path()), (0..=99).collect::<Vec<_>>());
}

#[tokio::test]
async fn records_past_the_checkpoint_are_discarded_on_restart() {
    let dir = tempfile::tempdir().unwrap();
    run_to(dir.path(), 20, 30, 100).await;

    // Simulate a crash after a flush that never reached a checkpoint: three
    // extra records plus a torn line land in the active segment.
    let active = dir.path().join("segments/blocks_000000020_000000039.jsonl");
    let mut file = fs::OpenOptions::new().append(true).open(&active).unwrap();
    for height in 31..34u64 {
        let line = Record::from(chainarchive_core::BlockHeader {
            height,
            hash: "f".repeat(64),
            time: 0,
        })
        .to_line()
        .unwrap();
        writeln!(file, "{line}").unwrap();
    }
    file.write_all(b"{\"height\":34,\"hash\":\"ff").unwrap();
    drop(file);

    run_to(dir.path(), 20, 45, 100).await;

    let straight = tempfile::tempdir().unwrap();
    run_to(straight.path(), 20, 45, 100).await;
    assert_eq!(snapshot(dir.path()), snapshot(straight.path()));
    assert_eq!(positions(dir.path()), (0..=45).collect::<Vec<_>>());
}

#[tokio::test]
async fn shutdown_mid_catchup_commits_then_resumes_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    {
        let (trigger, mut shutdown) = shutdown_channel();
        let producer = MemoryProducer::blocks(0, 500);
        producer.shutdown_at(123, trigger);
        let mut ingest =
            IngestionLoop::with_file_store(config(dir.path(), 50, 400), producer, Arc::new(NoopSink))
                .unwrap();
        assert_eq!(ingest.run(&mut shutdown).await.unwrap(), IngestExit::Shutdown);
    }

    // Everything the checkpoint claims is on disk, and nothing beyond it.
    let checkpoint = read_checkpoint(&dir.path().join("state/blocks.json"))
        .unwrap()
        .unwrap();
    assert_eq!(checkpoint.last_position_written, Some(123));
    assert_eq!(positions(dir.path()), (0..=123).collect::<Vec<_>>());

    run_to(dir.path(), 50, 400, 500).await;
    let straight = tempfile::tempdir().unwrap();
    run_to(straight.path(), 50, 400, 500).await;
    assert_eq!(snapshot(dir.path()), snapshot(straight.path()));
}

#[tokio::test]
async fn corrupt_checkpoint_adopts_progress_found_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    run_to(dir.path(), 10, 14, 50).await;
    fs::write(dir.path().join("state/blocks.json"), b"{ not json").unwrap();

    run_to(dir.path(), 10, 20, 50).await;
    assert_eq!(positions(dir.path()), (0..=20).collect::<Vec<_>>());
    assert!(dir.path().join("state/blocks.json.corrupt").exists());

    let checkpoint = read_checkpoint(&dir.path().join("state/blocks.json"))
        .unwrap()
        .unwrap();
    assert_eq!(checkpoint.last_position_written, Some(20));
}

fn txid(height: u64, index: u64) -> Record {
    Record::from(TransactionId {
        height,
        block_hash: format!("{height:064x}"),
        block_time: 1_231_006_505 + height as i64 * 600,
        txid: format!("{:064x}", height * 100 + index),
    })
}

#[tokio::test]
async fn position_cut_mid_flush_is_fetched_again_without_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let segments = dir.path().join("segments");
    fs::create_dir_all(&segments).unwrap();

    // Position 0 complete, position 1 holds only its first txid.
    let mut file = fs::File::create(segments.join("txids_000000000_000000009.jsonl")).unwrap();
    for record in [txid(0, 0), txid(0, 1), txid(1, 0)] {
        writeln!(file, "{}", record.to_line().unwrap()).unwrap();
    }
    drop(file);

    let producer = MemoryProducer::new(Entity::Txids);
    for height in 0..=2 {
        producer.insert(height, vec![txid(height, 0), txid(height, 1)]);
    }
    producer.set_frontier(2);

    let config = IngestBuilder::new(Entity::Txids)
        .output_dir(&segments)
        .checkpoint_path(dir.path().join("state/txids.json"))
        .segment_size(10)
        .finality_lag(0)
        .stop_position(2)
        .poll_interval_ms(5)
        .build_config()
        .unwrap();
    let (_trigger, mut shutdown) = shutdown_channel();
    let mut ingest = IngestionLoop::with_file_store(config, producer, Arc::new(LogSink)).unwrap();
    assert_eq!(ingest.run(&mut shutdown).await.unwrap(), IngestExit::Completed);

    let written: Vec<Record> = fs::read_to_string(segments.join("txids_000000000_000000009.jsonl"))
        .unwrap()
        .lines()
        .map(|l| Record::parse_line(Entity::Txids, l.as_bytes()).unwrap())
        .collect();
    let expected: Vec<Record> = (0..=2)
        .flat_map(|h| [txid(h, 0), txid(h, 1)])
        .collect();
    assert_eq!(written, expected);

    let checkpoint = read_checkpoint(&dir.path().join("state/txids.json"))
        .unwrap()
        .unwrap();
    assert_eq!(checkpoint.last_position_written, Some(2));
}
