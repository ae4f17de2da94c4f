//! Collaborator contracts: the record producer and the metadata sink.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::ProducerError;
use crate::record::{BlockHeader, Entity, Record};
use crate::shutdown::ShutdownTrigger;

/// Source of records, addressed by position.
#[async_trait]
pub trait Producer: Send + Sync {
    /// The entity every record from this producer belongs to.
    fn entity(&self) -> Entity;

    /// Highest position currently available.
    async fn current_frontier(&self) -> Result<u64, ProducerError>;

    /// All records at `position`, in producer order. May be empty.
    async fn fetch(&self, position: u64) -> Result<Vec<Record>, ProducerError>;
}

#[async_trait]
impl<P: Producer + ?Sized> Producer for Box<P> {
    fn entity(&self) -> Entity {
        (**self).entity()
    }

    async fn current_frontier(&self) -> Result<u64, ProducerError> {
        (**self).current_frontier().await
    }

    async fn fetch(&self, position: u64) -> Result<Vec<Record>, ProducerError> {
        (**self).fetch(position).await
    }
}

/// Error from a metadata sink. Always swallowed by the loops.
#[derive(Debug, thiserror::Error)]
#[error("metadata sink error: {0}")]
pub struct SinkError(pub String);

/// Secondary, best-effort bookkeeping (e.g. a key/value store read by a
/// web frontend). Never on the durability path.
#[async_trait]
pub trait MetadataSink: Send + Sync {
    async fn mark_dirty(&self, key: &str) -> Result<(), SinkError>;

    async fn set_timestamp(&self, key: &str, value: DateTime<Utc>) -> Result<(), SinkError>;
}

/// Calls `mark_dirty`, logging and discarding any failure.
pub async fn notify_dirty(sink: &dyn MetadataSink, key: &str) {
    if let Err(e) = sink.mark_dirty(key).await {
        tracing::debug!(key, error = %e, "metadata sink mark_dirty failed");
    }
}

/// Calls `set_timestamp` with the current time, logging and discarding any
/// failure.
pub async fn notify_timestamp(sink: &dyn MetadataSink, key: &str) {
    if let Err(e) = sink.set_timestamp(key, Utc::now()).await {
        tracing::debug!(key, error = %e, "metadata sink set_timestamp failed");
    }
}

/// Sink that does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

#[async_trait]
impl MetadataSink for NoopSink {
    async fn mark_dirty(&self, _key: &str) -> Result<(), SinkError> {
        Ok(())
    }

    async fn set_timestamp(&self, _key: &str, _value: DateTime<Utc>) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Sink that forwards every call to `tracing` at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl MetadataSink for LogSink {
    async fn mark_dirty(&self, key: &str) -> Result<(), SinkError> {
        tracing::debug!(key, "metadata dirty");
        Ok(())
    }

    async fn set_timestamp(&self, key: &str, value: DateTime<Utc>) -> Result<(), SinkError> {
        tracing::debug!(key, value = %value.to_rfc3339(), "metadata timestamp");
        Ok(())
    }
}

// ─── In-memory sink (for testing) ─────────────────────────────────────────────

/// One call received by a [`MemorySink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkCall {
    Dirty(String),
    Timestamp(String),
}

/// Records calls; can be told to fail every call.
#[derive(Debug, Default)]
pub struct MemorySink {
    calls: Mutex<Vec<SinkCall>>,
    fail: bool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn calls(&self) -> Vec<SinkCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn record(&self, call: SinkCall) -> Result<(), SinkError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
        if self.fail {
            Err(SinkError("sink unavailable".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl MetadataSink for MemorySink {
    async fn mark_dirty(&self, key: &str) -> Result<(), SinkError> {
        self.record(SinkCall::Dirty(key.to_string()))
    }

    async fn set_timestamp(&self, key: &str, _value: DateTime<Utc>) -> Result<(), SinkError> {
        self.record(SinkCall::Timestamp(key.to_string()))
    }
}

// ─── In-memory producer (for testing) ─────────────────────────────────────────

/// Producer backed by a map of prepared records.
///
/// Supports injected transient failures and firing a shutdown trigger when a
/// given position is fetched.
pub struct MemoryProducer {
    entity: Entity,
    frontier: AtomicU64,
    records: Mutex<BTreeMap<u64, Vec<Record>>>,
    failures: Mutex<HashMap<u64, u32>>,
    frontier_failures: AtomicU64,
    shutdown_at: Mutex<Option<(u64, ShutdownTrigger)>>,
    fetches: AtomicU64,
}

impl MemoryProducer {
    pub fn new(entity: Entity) -> Self {
        Self {
            entity,
            frontier: AtomicU64::new(0),
            records: Mutex::new(BTreeMap::new()),
            failures: Mutex::new(HashMap::new()),
            frontier_failures: AtomicU64::new(0),
            shutdown_at: Mutex::new(None),
            fetches: AtomicU64::new(0),
        }
    }

    /// One block header per position in `from..=to`; frontier set to `to`.
    pub fn blocks(from: u64, to: u64) -> Self {
        let producer = Self::new(Entity::Blocks);
        for height in from..=to {
            producer.insert(
                height,
                vec![Record::from(BlockHeader {
                    height,
                    hash: format!("{height:064x}"),
                    time: 1_231_006_505 + height as i64 * 600,
                })],
            );
        }
        producer.set_frontier(to);
        producer
    }

    pub fn insert(&self, position: u64, records: Vec<Record>) {
        if let Ok(mut map) = self.records.lock() {
            map.insert(position, records);
        }
    }

    pub fn set_frontier(&self, frontier: u64) {
        self.frontier.store(frontier, Ordering::SeqCst);
    }

    /// The next `times` fetches of `position` fail transiently.
    pub fn fail_transiently(&self, position: u64, times: u32) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.insert(position, times);
        }
    }

    /// The next `times` frontier queries fail transiently.
    pub fn fail_frontier(&self, times: u64) {
        self.frontier_failures.store(times, Ordering::SeqCst);
    }

    /// Fire `trigger` right after `position` is fetched.
    pub fn shutdown_at(&self, position: u64, trigger: ShutdownTrigger) {
        if let Ok(mut slot) = self.shutdown_at.lock() {
            *slot = Some((position, trigger));
        }
    }

    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Producer for MemoryProducer {
    fn entity(&self) -> Entity {
        self.entity
    }

    async fn current_frontier(&self) -> Result<u64, ProducerError> {
        let remaining = self.frontier_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.frontier_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(ProducerError::Transient("frontier unavailable".into()));
        }
        Ok(self.frontier.load(Ordering::SeqCst))
    }

    async fn fetch(&self, position: u64) -> Result<Vec<Record>, ProducerError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut failures) = self.failures.lock() {
            if let Some(left) = failures.get_mut(&position) {
                if *left > 0 {
                    *left -= 1;
                    return Err(ProducerError::Transient(format!("timeout at {position}")));
                }
            }
        }
        let records = self
            .records
            .lock()
            .map_err(|_| ProducerError::Fatal("records lock poisoned".into()))?
            .get(&position)
            .cloned()
            .unwrap_or_default();
        if let Ok(slot) = self.shutdown_at.lock() {
            if let Some((at, trigger)) = slot.as_ref() {
                if *at == position {
                    trigger.trigger();
                }
            }
        }
        Ok(records)
    }
}
