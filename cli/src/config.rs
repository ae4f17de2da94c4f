//! The `chainarchive.json` configuration file.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{bail, Context, Result};
use chainarchive_bitcoin::BitcoinRpcConfig;
use chainarchive_core::{Entity, IngestConfig};
use chainarchive_sitemap::SitemapConfig;
use serde::{Deserialize, Serialize};

use crate::logging::LogConfig;

/// Everything one `chainarchive` process runs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub rpc: BitcoinRpcConfig,
    /// Ingestion streams, at most one per entity.
    #[serde(default)]
    pub streams: Vec<IngestConfig>,
    /// Sitemap families, unique by name.
    #[serde(default)]
    pub sitemaps: Vec<SitemapConfig>,
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file '{}'", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("parsing config file '{}'", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let mut entities = HashSet::new();
        for stream in &self.streams {
            stream.validate()?;
            if !entities.insert(stream.entity) {
                bail!("stream '{}' is configured twice", stream.entity);
            }
        }

        let mut names = HashSet::new();
        for family in &self.sitemaps {
            family.validate()?;
            if !names.insert(family.name.as_str()) {
                bail!("sitemap family '{}' is configured twice", family.name);
            }
        }
        Ok(())
    }

    pub fn stream(&self, entity: Entity) -> Result<&IngestConfig> {
        self.streams
            .iter()
            .find(|s| s.entity == entity)
            .with_context(|| format!("no stream configured for '{entity}'"))
    }

    pub fn sitemap(&self, name: &str) -> Result<&SitemapConfig> {
        self.sitemaps
            .iter()
            .find(|s| s.name == name)
            .with_context(|| format!("no sitemap family named '{name}'"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "log": { "level": "debug", "json": true },
        "rpc": { "url": "http://10.0.0.2:8332", "cookie_file": "/var/lib/bitcoind/.cookie" },
        "streams": [
            { "entity": "blocks", "output_dir": "data/blocks/segments",
              "checkpoint_path": "data/blocks/checkpoint.json", "segment_size": 1000 },
            { "entity": "txids", "finality_lag": 6 }
        ],
        "sitemaps": [{
            "name": "txids",
            "entity": "txids",
            "segments_dir": "data/txids/segments",
            "checkpoint_path": "data/txids/checkpoint.json",
            "shards_dir": "public/sitemaps",
            "shard_prefix": "sitemap_txids",
            "state_path": "data/sitemaps/txids.json",
            "root_index_path": "public/sitemap_txids.xml",
            "shard_base_url": "https://x.test/sitemaps/",
            "url": { "loc_prefix": "https://x.test/tx/" }
        }]
    }"#;

    #[test]
    fn sample_config_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chainarchive.json");
        std::fs::write(&path, SAMPLE).unwrap();

        let config = AppConfig::load(&path).unwrap();
        assert!(config.log.json);
        assert_eq!(config.rpc.timeout_ms, 30_000);
        assert_eq!(config.stream(Entity::Blocks).unwrap().segment_size, 1_000);

        let txids = config.stream(Entity::Txids).unwrap();
        assert_eq!(txids.finality_lag, 6);
        assert_eq!(txids.segment_size, 10_000);
        assert_eq!(config.sitemap("txids").unwrap().max_urls_per_shard, 50_000);
        assert!(config.stream(Entity::Addresses).is_err());
        assert!(config.sitemap("blocks").is_err());
    }

    #[test]
    fn empty_document_is_valid() {
        let config: AppConfig = serde_json::from_str("{}").unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn duplicate_stream_is_rejected() {
        let config: AppConfig = serde_json::from_str(
            r#"{ "streams": [{ "entity": "blocks" }, { "entity": "blocks" }] }"#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_segment_size_is_rejected() {
        let config: AppConfig =
            serde_json::from_str(r#"{ "streams": [{ "entity": "blocks", "segment_size": 0 }] }"#)
                .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_file_names_the_path() {
        let err = AppConfig::load(Path::new("/nonexistent/chainarchive.json")).unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/chainarchive.json"));
    }
}
