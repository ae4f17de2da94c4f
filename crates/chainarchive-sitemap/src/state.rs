//! Durable progress of one sitemap family.

use std::path::Path;

use chainarchive_core::error::ArchiveError;
use chainarchive_core::persist::{self, null_as_default, LoadOrigin};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Where the builder is in the segment stream and in its shards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardIndexState {
    /// Segment file name being read. `None` before the first segment.
    #[serde(
        default,
        alias = "current_file",
        deserialize_with = "deserialize_file_name"
    )]
    pub source_file: Option<String>,
    /// Bytes of `source_file` already consumed.
    #[serde(default, alias = "offset", deserialize_with = "null_as_default")]
    pub source_offset: u64,
    #[serde(
        default = "first_shard",
        alias = "shard_idx",
        deserialize_with = "deserialize_shard_index"
    )]
    pub shard_index: u32,
    #[serde(default, deserialize_with = "null_as_default")]
    pub urls_in_shard: u64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub written_total: u64,
    /// Most recently emitted keys, oldest first.
    #[serde(default, alias = "last_txids", deserialize_with = "null_as_default")]
    pub replay_ring: Vec<String>,
    #[serde(default, alias = "updated_utc")]
    pub updated_at: Option<DateTime<Utc>>,
}

fn first_shard() -> u32 {
    1
}

/// Older state files stored the full path; only the name is kept.
fn deserialize_file_name<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    let raw = Option::<String>::deserialize(d)?;
    Ok(raw.and_then(|s| {
        Path::new(&s)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .filter(|n| !n.is_empty())
    }))
}

fn deserialize_shard_index<'de, D: Deserializer<'de>>(d: D) -> Result<u32, D::Error> {
    Ok(Option::<u32>::deserialize(d)?.unwrap_or(0).max(1))
}

impl Default for ShardIndexState {
    fn default() -> Self {
        Self {
            source_file: None,
            source_offset: 0,
            shard_index: first_shard(),
            urls_in_shard: 0,
            written_total: 0,
            replay_ring: Vec::new(),
            updated_at: None,
        }
    }
}

impl ShardIndexState {
    pub fn touch(&mut self) {
        self.updated_at = Some(Utc::now());
    }

    /// Loads the state, creating it with defaults when missing or unreadable.
    pub fn load(path: &Path) -> Result<Self, ArchiveError> {
        let loaded = persist::load_json_or_default(path, || {
            let mut state = Self::default();
            state.touch();
            state
        })?;
        match &loaded.origin {
            LoadOrigin::Existing => {}
            LoadOrigin::Created => {
                tracing::info!(path = %path.display(), "created sitemap state with defaults")
            }
            LoadOrigin::Reset { reason } => tracing::warn!(
                path = %path.display(),
                reason = %reason,
                "sitemap state unreadable, moved aside and reset to defaults"
            ),
        }
        Ok(loaded.value)
    }

    pub fn save(&self, path: &Path) -> Result<(), ArchiveError> {
        persist::write_json_atomic(path, self)
    }

    /// Reads the state without creating or repairing it.
    pub fn read(path: &Path) -> Result<Option<Self>, ArchiveError> {
        persist::read_json(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_fields_load() {
        let raw = r#"{
            "current_file": "/data/txids/segments/txids_000000000_000009999.jsonl",
            "offset": 4096,
            "shard_idx": 3,
            "urls_in_shard": null,
            "written_total": 120001,
            "last_txids": ["aa", "bb"],
            "updated_utc": "2024-05-01T10:00:00Z"
        }"#;
        let state: ShardIndexState = serde_json::from_str(raw).unwrap();
        assert_eq!(
            state.source_file.as_deref(),
            Some("txids_000000000_000009999.jsonl")
        );
        assert_eq!(state.source_offset, 4096);
        assert_eq!(state.shard_index, 3);
        assert_eq!(state.urls_in_shard, 0);
        assert_eq!(state.written_total, 120_001);
        assert_eq!(state.replay_ring, ["aa", "bb"]);
        assert!(state.updated_at.is_some());
    }

    #[test]
    fn empty_document_gets_defaults() {
        let state: ShardIndexState = serde_json::from_str("{}").unwrap();
        assert_eq!(state, ShardIndexState::default());
        let zero: ShardIndexState = serde_json::from_str(r#"{"shard_index": 0}"#).unwrap();
        assert_eq!(zero.shard_index, 1);
    }

    #[test]
    fn load_creates_then_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state/blocks.json");
        let mut state = ShardIndexState::load(&path).unwrap();
        assert_eq!(state.shard_index, 1);

        state.source_file = Some("blocks_000000000_000009999.jsonl".into());
        state.source_offset = 77;
        state.save(&path).unwrap();
        assert_eq!(ShardIndexState::read(&path).unwrap(), Some(state));
    }
}
