//! Configuration of one sitemap family.

use std::path::PathBuf;

use chainarchive_core::error::ArchiveError;
use chainarchive_core::record::Entity;
use serde::{Deserialize, Serialize};

use crate::layout::{ShardLayout, UrlTemplate};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SitemapConfig {
    /// Family name, used in logs and metadata keys.
    pub name: String,
    /// Segment stream read by this family.
    pub entity: Entity,
    pub segments_dir: PathBuf,
    /// Ingest checkpoint of `entity`. When set, only positions it covers are
    /// indexed.
    #[serde(default)]
    pub checkpoint_path: Option<PathBuf>,
    pub shards_dir: PathBuf,
    pub shard_prefix: String,
    #[serde(default = "default_shard_pad")]
    pub shard_pad: usize,
    pub state_path: PathBuf,
    pub root_index_path: PathBuf,
    /// Prepended to shard file names in the root index.
    pub shard_base_url: String,
    /// Listed in the root index before the shards.
    #[serde(default)]
    pub extra_index_locs: Vec<String>,
    pub url: UrlTemplate,
    #[serde(default = "default_max_urls_per_shard")]
    pub max_urls_per_shard: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Keys remembered for replay suppression; 0 disables it.
    #[serde(default = "default_replay_ring_size")]
    pub replay_ring_size: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
}

fn default_shard_pad() -> usize {
    6
}

fn default_max_urls_per_shard() -> u64 {
    50_000
}

fn default_batch_size() -> usize {
    1_000
}

fn default_replay_ring_size() -> usize {
    50_000
}

fn default_poll_interval_ms() -> u64 {
    10_000
}

fn default_heartbeat_interval_ms() -> u64 {
    15_000
}

impl SitemapConfig {
    /// Defaults for a family over `entity`, with segments read from
    /// `data/{entity}/` and output under `data/sitemaps/{name}/`.
    pub fn for_entity(name: impl Into<String>, entity: Entity, loc_prefix: impl Into<String>) -> Self {
        let name = name.into();
        let data = PathBuf::from("data").join(entity.as_str());
        let out = PathBuf::from("data").join("sitemaps").join(&name);
        Self {
            shard_prefix: format!("sitemap_{name}"),
            segments_dir: data.join("segments"),
            checkpoint_path: Some(data.join("checkpoint.json")),
            shards_dir: out.join("shards"),
            shard_pad: default_shard_pad(),
            state_path: out.join("state.json"),
            root_index_path: out.join(format!("sitemap_{name}.xml")),
            shard_base_url: String::new(),
            extra_index_locs: Vec::new(),
            url: UrlTemplate::new(loc_prefix),
            max_urls_per_shard: default_max_urls_per_shard(),
            batch_size: default_batch_size(),
            replay_ring_size: default_replay_ring_size(),
            poll_interval_ms: default_poll_interval_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            entity,
            name,
        }
    }

    pub fn layout(&self) -> ShardLayout {
        ShardLayout::new(&self.shards_dir, &self.shard_prefix, self.shard_pad)
    }

    pub fn validate(&self) -> Result<(), ArchiveError> {
        if self.name.is_empty() {
            return Err(ArchiveError::Config("sitemap family needs a name".into()));
        }
        let invalid = |what: &str| {
            Err(ArchiveError::Config(format!(
                "sitemap '{}': {what} must be positive",
                self.name
            )))
        };
        if self.max_urls_per_shard == 0 {
            return invalid("max_urls_per_shard");
        }
        if self.batch_size == 0 {
            return invalid("batch_size");
        }
        if self.shard_pad == 0 {
            return invalid("shard_pad");
        }
        if self.shard_prefix.is_empty() {
            return Err(ArchiveError::Config(format!(
                "sitemap '{}': shard_prefix is empty",
                self.name
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_defaults() {
        let cfg: SitemapConfig = serde_json::from_str(
            r#"{
                "name": "txids",
                "entity": "txids",
                "segments_dir": "data/txids/segments",
                "shards_dir": "public/sitemaps",
                "shard_prefix": "sitemap_txids",
                "state_path": "data/sitemaps/txids.json",
                "root_index_path": "public/sitemap_txids.xml",
                "shard_base_url": "https://x.test/sitemaps/",
                "url": { "loc_prefix": "https://x.test/tx/" }
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.shard_pad, 6);
        assert_eq!(cfg.max_urls_per_shard, 50_000);
        assert_eq!(cfg.batch_size, 1_000);
        assert_eq!(cfg.replay_ring_size, 50_000);
        assert_eq!(cfg.url.changefreq, "weekly");
        assert_eq!(cfg.url.priority, "0.8");
        assert!(cfg.checkpoint_path.is_none());
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.layout().file_name(7), "sitemap_txids_000007.xml");
    }

    #[test]
    fn rejects_zero_capacity() {
        let mut cfg = SitemapConfig::for_entity("blocks", Entity::Blocks, "https://x.test/block/");
        assert!(cfg.validate().is_ok());
        cfg.max_urls_per_shard = 0;
        assert!(cfg.validate().is_err());
        cfg.max_urls_per_shard = 10;
        cfg.batch_size = 0;
        assert!(cfg.validate().is_err());
    }
}
