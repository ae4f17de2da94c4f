//! Root `<sitemapindex>` listing every shard of a family.

use std::path::Path;

use chainarchive_core::error::ArchiveError;
use chainarchive_core::persist;

use crate::layout::{escape_xml, ShardLayout};

pub fn render_root_index<I, S>(locs: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out = String::from(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
         <sitemapindex xmlns=\"http://www.sitemaps.org/schemas/sitemap/0.9\">\n",
    );
    for loc in locs {
        out.push_str("  <sitemap>\n    <loc>");
        out.push_str(&escape_xml(loc.as_ref()));
        out.push_str("</loc>\n  </sitemap>\n");
    }
    out.push_str("</sitemapindex>\n");
    out
}

/// Rewrites `path` from the shards currently on disk.
///
/// `extra_locs` come first, then every shard as `{base_url}{name}`.
/// Returns the number of shards listed.
pub fn rebuild_root_index(
    path: &Path,
    layout: &ShardLayout,
    base_url: &str,
    extra_locs: &[String],
) -> Result<usize, ArchiveError> {
    let shards = layout.list_shards()?;
    let locs = extra_locs
        .iter()
        .cloned()
        .chain(shards.iter().map(|s| format!("{base_url}{}", s.name)));
    persist::write_atomic(path, render_root_index(locs).as_bytes())?;

    tracing::info!(index = %path.display(), shards = shards.len(), "root index rebuilt");
    Ok(shards.len())
}
