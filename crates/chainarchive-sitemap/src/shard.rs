//! Footer-safe append to urlset shard files.
//!
//! A shard on disk is always `header, entries, footer`. New entries are
//! buffered in memory; [`ShardWriter::close`] cuts the footer off, appends
//! the batch, writes the footer back and fsyncs. That close is the only
//! moment the file lacks a footer, and no state is saved until it returns.
//!
//! A file left without a footer (crash inside that window) is repaired on
//! open: a torn trailing entry is dropped and the footer appended.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chainarchive_core::error::{io_at, ArchiveError};
use chainarchive_core::persist;

use crate::layout::{unescape_xml, ShardLayout, URLSET_FOOTER, URLSET_HEADER};

const FOOTER_TAG: &[u8] = b"</urlset>";
const URLSET_OPEN: &[u8] = b"<urlset";
const ENTRY_OPEN: &[u8] = b"<url>";
const ENTRY_CLOSE: &[u8] = b"</url>";
const TAIL_WINDOW: u64 = 256 * 1024;

/// An open shard accepting new entries.
#[derive(Debug)]
pub struct ShardWriter {
    index: u32,
    path: PathBuf,
    file: File,
    footer_offset: u64,
    pending: Vec<u8>,
    pending_entries: usize,
    created: bool,
}

impl ShardWriter {
    /// Opens shard `index`, creating it with header and footer when absent.
    pub fn open_for_append(layout: &ShardLayout, index: u32) -> Result<Self, ArchiveError> {
        let path = layout.path(index);
        let created = !path.exists();
        if created {
            persist::write_atomic(&path, format!("{URLSET_HEADER}{URLSET_FOOTER}").as_bytes())?;
            tracing::info!(shard = %path.display(), shard_index = index, "created shard");
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(io_at(&path))?;

        let footer_offset = match locate_footer(&mut file, &path)? {
            Some(offset) => offset,
            None => {
                repair_footer(&mut file, &path)?;
                locate_footer(&mut file, &path)?.ok_or_else(|| {
                    ArchiveError::ShardUnrecoverable {
                        path: path.clone(),
                        reason: "footer still missing after repair".into(),
                    }
                })?
            }
        };

        Ok(Self {
            index,
            path,
            file,
            footer_offset,
            pending: Vec::new(),
            pending_entries: 0,
            created,
        })
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether this open created the file.
    pub fn created(&self) -> bool {
        self.created
    }

    pub fn pending_entries(&self) -> usize {
        self.pending_entries
    }

    /// Queues one rendered `<url>` entry.
    pub fn append_entry(&mut self, entry: &str) {
        self.pending.extend_from_slice(entry.as_bytes());
        self.pending_entries += 1;
    }

    /// Writes queued entries followed by the footer and fsyncs the shard.
    pub fn close(mut self) -> Result<(), ArchiveError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let result = self.write_batch();
        if result.is_err() {
            // Put a footer back so the file stays a document.
            let _ = self.restore_footer();
        }
        result
    }

    fn write_batch(&mut self) -> Result<(), ArchiveError> {
        let path = self.path.clone();
        self.pending.extend_from_slice(URLSET_FOOTER.as_bytes());

        self.file.set_len(self.footer_offset).map_err(io_at(&path))?;
        self.file
            .seek(SeekFrom::Start(self.footer_offset))
            .map_err(io_at(&path))?;
        self.file.write_all(&self.pending).map_err(io_at(&path))?;
        self.file.sync_all().map_err(io_at(&path))?;

        tracing::debug!(
            shard = %path.display(),
            entries = self.pending_entries,
            "shard batch committed"
        );
        self.footer_offset += (self.pending.len() - URLSET_FOOTER.len()) as u64;
        self.pending.clear();
        self.pending_entries = 0;
        Ok(())
    }

    fn restore_footer(&mut self) -> std::io::Result<()> {
        self.file.set_len(self.footer_offset)?;
        self.file.seek(SeekFrom::Start(self.footer_offset))?;
        self.file.write_all(URLSET_FOOTER.as_bytes())?;
        self.file.sync_all()
    }
}

impl Drop for ShardWriter {
    fn drop(&mut self) {
        if self.pending_entries > 0 {
            tracing::warn!(
                shard = %self.path.display(),
                entries = self.pending_entries,
                "shard dropped with uncommitted entries"
            );
        }
    }
}

fn rfind(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).rposition(|w| w == needle)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn count(haystack: &[u8], needle: &[u8]) -> usize {
    if needle.len() > haystack.len() {
        return 0;
    }
    haystack.windows(needle.len()).filter(|w| *w == needle).count()
}

/// Byte offset of the last `</urlset>`: tail window first, then full file.
fn locate_footer(file: &mut File, path: &Path) -> Result<Option<u64>, ArchiveError> {
    let len = file.metadata().map_err(io_at(path))?.len();
    let window_start = len.saturating_sub(TAIL_WINDOW);

    let mut tail = Vec::new();
    file.seek(SeekFrom::Start(window_start)).map_err(io_at(path))?;
    file.read_to_end(&mut tail).map_err(io_at(path))?;
    if let Some(at) = rfind(&tail, FOOTER_TAG) {
        return Ok(Some(window_start + at as u64));
    }
    if window_start == 0 {
        return Ok(None);
    }

    let mut all = Vec::new();
    file.seek(SeekFrom::Start(0)).map_err(io_at(path))?;
    file.read_to_end(&mut all).map_err(io_at(path))?;
    Ok(rfind(&all, FOOTER_TAG).map(|at| at as u64))
}

/// Offset just past the `<urlset ...>` start tag and its newline.
fn header_end(bytes: &[u8]) -> Option<usize> {
    let open = find(bytes, URLSET_OPEN)?;
    let close = open + bytes[open..].iter().position(|b| *b == b'>')? + 1;
    if bytes.get(close) == Some(&b'\n') {
        Some(close + 1)
    } else {
        Some(close)
    }
}

fn repair_footer(file: &mut File, path: &Path) -> Result<(), ArchiveError> {
    let mut bytes = Vec::new();
    file.seek(SeekFrom::Start(0)).map_err(io_at(path))?;
    file.read_to_end(&mut bytes).map_err(io_at(path))?;

    let Some(body_start) = header_end(&bytes) else {
        return Err(ArchiveError::ShardUnrecoverable {
            path: path.to_path_buf(),
            reason: "urlset header not found".into(),
        });
    };

    let keep = match rfind(&bytes[body_start..], ENTRY_CLOSE) {
        Some(at) => {
            let end = body_start + at + ENTRY_CLOSE.len();
            if bytes.get(end) == Some(&b'\n') {
                end + 1
            } else {
                end
            }
        }
        None => body_start,
    };

    let mut tail = Vec::new();
    if keep > 0 && bytes[keep - 1] != b'\n' {
        tail.push(b'\n');
    }
    tail.extend_from_slice(URLSET_FOOTER.as_bytes());

    file.set_len(keep as u64).map_err(io_at(path))?;
    file.seek(SeekFrom::Start(keep as u64)).map_err(io_at(path))?;
    file.write_all(&tail).map_err(io_at(path))?;
    file.sync_all().map_err(io_at(path))?;

    tracing::warn!(
        shard = %path.display(),
        kept_bytes = keep,
        dropped_bytes = bytes.len() - keep,
        "shard footer missing, repaired"
    );
    Ok(())
}

/// Structural check of a shard file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardValidity {
    pub header: bool,
    pub footers: usize,
    /// Nothing but whitespace follows the footer.
    pub footer_last: bool,
    pub entries: usize,
}

impl ShardValidity {
    pub fn is_valid(&self) -> bool {
        self.header && self.footers == 1 && self.footer_last
    }
}

pub fn validate_shard(path: &Path) -> Result<ShardValidity, ArchiveError> {
    let bytes = std::fs::read(path).map_err(io_at(path))?;
    let header = header_end(&bytes).is_some();
    let footer_last = rfind(&bytes, FOOTER_TAG)
        .map(|at| {
            bytes[at + FOOTER_TAG.len()..]
                .iter()
                .all(|b| b.is_ascii_whitespace())
        })
        .unwrap_or(false);
    Ok(ShardValidity {
        header,
        footers: count(&bytes, FOOTER_TAG),
        footer_last,
        entries: count(&bytes, ENTRY_OPEN),
    })
}

/// Unescaped `<loc>` values of a shard, in file order.
pub fn read_locs(path: &Path) -> Result<Vec<String>, ArchiveError> {
    let text = std::fs::read_to_string(path).map_err(io_at(path))?;
    let mut locs = Vec::new();
    let mut rest = text.as_str();
    while let Some(open) = rest.find("<loc>") {
        let after = &rest[open + "<loc>".len()..];
        let Some(close) = after.find("</loc>") else {
            break;
        };
        locs.push(unescape_xml(&after[..close]).into_owned());
        rest = &after[close + "</loc>".len()..];
    }
    Ok(locs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::UrlTemplate;

    fn layout(dir: &Path) -> ShardLayout {
        ShardLayout::new(dir, "sitemap_blocks", 6)
    }

    #[test]
    fn new_shard_is_a_complete_document() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ShardWriter::open_for_append(&layout(dir.path()), 1).unwrap();
        assert!(writer.created());
        let path = writer.path().to_path_buf();
        writer.close().unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, format!("{URLSET_HEADER}{URLSET_FOOTER}"));
        assert!(validate_shard(&path).unwrap().is_valid());
    }

    #[test]
    fn appends_keep_exactly_one_footer() {
        let dir = tempfile::tempdir().unwrap();
        let layout = layout(dir.path());
        let url = UrlTemplate::new("https://x.test/block/");

        for batch in [["1", "2"], ["3", "4"]] {
            let mut writer = ShardWriter::open_for_append(&layout, 1).unwrap();
            for key in batch {
                writer.append_entry(&url.render(key));
            }
            writer.close().unwrap();
        }

        let path = layout.path(1);
        let validity = validate_shard(&path).unwrap();
        assert!(validity.is_valid());
        assert_eq!(validity.entries, 4);
        let locs = read_locs(&path).unwrap();
        assert_eq!(locs.first().map(String::as_str), Some("https://x.test/block/1"));
        assert_eq!(locs.len(), 4);
        assert!(std::fs::read_to_string(&path).unwrap().ends_with("  </url>\n</urlset>\n"));
    }

    #[test]
    fn torn_entry_without_footer_is_repaired() {
        let dir = tempfile::tempdir().unwrap();
        let layout = layout(dir.path());
        let url = UrlTemplate::new("https://x.test/tx/");
        let path = layout.path(1);
        std::fs::write(
            &path,
            format!("{URLSET_HEADER}{}  <url>\n    <loc>https://x.t", url.render("aa")),
        )
        .unwrap();

        let mut writer = ShardWriter::open_for_append(&layout, 1).unwrap();
        writer.append_entry(&url.render("bb"));
        writer.close().unwrap();

        let validity = validate_shard(&path).unwrap();
        assert!(validity.is_valid());
        assert_eq!(
            read_locs(&path).unwrap(),
            ["https://x.test/tx/aa", "https://x.test/tx/bb"]
        );
    }

    #[test]
    fn truncated_to_header_is_repaired() {
        let dir = tempfile::tempdir().unwrap();
        let layout = layout(dir.path());
        std::fs::write(layout.path(2), URLSET_HEADER).unwrap();

        let writer = ShardWriter::open_for_append(&layout, 2).unwrap();
        assert!(!writer.created());
        drop(writer);
        let validity = validate_shard(&layout.path(2)).unwrap();
        assert!(validity.is_valid());
        assert_eq!(validity.entries, 0);
    }

    #[test]
    fn missing_header_is_unrecoverable() {
        let dir = tempfile::tempdir().unwrap();
        let layout = layout(dir.path());
        std::fs::write(layout.path(1), b"garbage without structure").unwrap();
        let err = ShardWriter::open_for_append(&layout, 1).unwrap_err();
        assert!(matches!(err, ArchiveError::ShardUnrecoverable { .. }));
    }

    #[test]
    fn footer_found_beyond_tail_window() {
        let dir = tempfile::tempdir().unwrap();
        let layout = layout(dir.path());
        let url = UrlTemplate::new("https://x.test/tx/");
        let path = layout.path(1);

        // Trailing padding longer than the tail window pushes the footer out
        // of it; the full scan still finds it and the padding is cut.
        let padding = " ".repeat(TAIL_WINDOW as usize + 10);
        std::fs::write(&path, format!("{URLSET_HEADER}{URLSET_FOOTER}{padding}")).unwrap();

        let mut writer = ShardWriter::open_for_append(&layout, 1).unwrap();
        writer.append_entry(&url.render("cc"));
        writer.close().unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.ends_with("</url>\n</urlset>\n"));
        assert!(validate_shard(&path).unwrap().is_valid());
    }
}
