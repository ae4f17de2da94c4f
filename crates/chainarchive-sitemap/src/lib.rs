//! chainarchive-sitemap: sharded sitemap index built from archive segments.
//!
//! # Architecture
//!
//! ```text
//! segment files → ShardIndexBuilder
//!                      ├── ShardIndexState  (source file + offset, shard counters)
//!                      ├── ReplayGuard      (recently emitted keys)
//!                      ├── ShardWriter      (footer-safe append, fsync per batch)
//!                      └── root index       (rebuilt when a shard is created)
//! ```

pub mod builder;
pub mod config;
pub mod index;
pub mod layout;
pub mod replay;
pub mod shard;
pub mod state;

pub use builder::{BuildStats, ShardIndexBuilder};
pub use config::SitemapConfig;
pub use index::{rebuild_root_index, render_root_index};
pub use layout::{ShardLayout, UrlTemplate};
pub use replay::ReplayGuard;
pub use shard::{read_locs, validate_shard, ShardValidity, ShardWriter};
pub use state::ShardIndexState;
