//! Shard file naming and the urlset entry format.

use std::borrow::Cow;
use std::fs;
use std::path::{Path, PathBuf};

use chainarchive_core::error::{io_at, ArchiveError};
use serde::{Deserialize, Serialize};

pub const URLSET_HEADER: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
<urlset xmlns=\"http://www.sitemaps.org/schemas/sitemap/0.9\">\n";

pub const URLSET_FOOTER: &str = "</urlset>\n";

/// Where the shards of one family live and how they are named:
/// `{dir}/{prefix}_{index:0pad}.xml`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardLayout {
    dir: PathBuf,
    prefix: String,
    pad: usize,
}

/// A shard file found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardFile {
    pub index: u32,
    pub name: String,
    pub path: PathBuf,
}

impl ShardLayout {
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>, pad: usize) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
            pad,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn file_name(&self, index: u32) -> String {
        format!("{}_{:0width$}.xml", self.prefix, index, width = self.pad)
    }

    pub fn path(&self, index: u32) -> PathBuf {
        self.dir.join(self.file_name(index))
    }

    /// Index encoded in `name`, if it is one of this family's shards.
    pub fn parse_index(&self, name: &str) -> Option<u32> {
        let digits = name
            .strip_prefix(self.prefix.as_str())?
            .strip_prefix('_')?
            .strip_suffix(".xml")?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok()
    }

    /// Shards on disk, ordered by index. A missing directory is empty.
    pub fn list_shards(&self) -> Result<Vec<ShardFile>, ArchiveError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(ArchiveError::io(&self.dir, e)),
        };

        let mut shards = Vec::new();
        for entry in entries {
            let entry = entry.map_err(io_at(&self.dir))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(index) = self.parse_index(&name) {
                shards.push(ShardFile {
                    index,
                    path: entry.path(),
                    name,
                });
            }
        }
        shards.sort_by_key(|s| s.index);
        Ok(shards)
    }
}

/// How a record key becomes a `<url>` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UrlTemplate {
    /// Prepended to the key, e.g. `https://explorer.example/tx/`.
    pub loc_prefix: String,
    #[serde(default = "default_changefreq")]
    pub changefreq: String,
    #[serde(default = "default_priority")]
    pub priority: String,
}

fn default_changefreq() -> String {
    "weekly".into()
}

fn default_priority() -> String {
    "0.8".into()
}

impl UrlTemplate {
    pub fn new(loc_prefix: impl Into<String>) -> Self {
        Self {
            loc_prefix: loc_prefix.into(),
            changefreq: default_changefreq(),
            priority: default_priority(),
        }
    }

    pub fn loc(&self, key: &str) -> String {
        format!("{}{}", self.loc_prefix, key)
    }

    pub fn render(&self, key: &str) -> String {
        format!(
            "  <url>\n    <loc>{}</loc>\n    <changefreq>{}</changefreq>\n    <priority>{}</priority>\n  </url>\n",
            escape_xml(&self.loc(key)),
            escape_xml(&self.changefreq),
            escape_xml(&self.priority),
        )
    }

    /// Inverse of [`loc`](Self::loc) for an (unescaped) `<loc>` value.
    pub fn key_from_loc<'a>(&self, loc: &'a str) -> Option<&'a str> {
        loc.strip_prefix(self.loc_prefix.as_str())
            .filter(|key| !key.is_empty())
    }
}

pub fn escape_xml(s: &str) -> Cow<'_, str> {
    if !s.contains(['&', '<', '>', '"', '\'']) {
        return Cow::Borrowed(s);
    }
    let mut out = String::with_capacity(s.len() + 8);
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    Cow::Owned(out)
}

pub fn unescape_xml(s: &str) -> Cow<'_, str> {
    if !s.contains('&') {
        return Cow::Borrowed(s);
    }
    Cow::Owned(
        s.replace("&lt;", "<")
            .replace("&gt;", ">")
            .replace("&quot;", "\"")
            .replace("&apos;", "'")
            .replace("&amp;", "&"),
    )
}
