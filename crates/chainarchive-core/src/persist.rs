//! Atomic JSON state files.
//!
//! Writes go to `<path>.tmp`, are flushed and fsynced, then renamed over the
//! destination; the parent directory is fsynced so the rename itself survives
//! a crash. Readers never observe a half-written document.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{io_at, ArchiveError};

/// How a state document came to be in memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOrigin {
    /// Parsed from an existing file.
    Existing,
    /// No file existed; defaults were written.
    Created,
    /// The file could not be parsed; it was moved aside and defaults written.
    Reset { reason: String },
}

/// A loaded state document plus where it came from.
#[derive(Debug, Clone)]
pub struct Loaded<T> {
    pub value: T,
    pub origin: LoadOrigin,
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// Atomically replaces `path` with `bytes`.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), ArchiveError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_at(parent))?;
    }

    let tmp = sibling(path, ".tmp");
    {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)
            .map_err(io_at(&tmp))?;
        let mut writer = BufWriter::new(file);
        writer.write_all(bytes).map_err(io_at(&tmp))?;
        writer.flush().map_err(io_at(&tmp))?;
        writer.get_ref().sync_all().map_err(io_at(&tmp))?;
    }
    fs::rename(&tmp, path).map_err(io_at(path))?;
    sync_parent_dir(path)
}

/// Serializes `value` as pretty JSON and atomically replaces `path`.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), ArchiveError> {
    let mut bytes = serde_json::to_vec_pretty(value)?;
    bytes.push(b'\n');
    write_atomic(path, &bytes)
}

/// Reads `path` without creating it.
///
/// Returns `Ok(None)` when the file does not exist; parse errors propagate.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, ArchiveError> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(ArchiveError::io(path, e)),
    }
}

/// Loads `path`, creating it from `default` when missing.
///
/// An unparseable file is never half-trusted: it is renamed to
/// `<path>.corrupt` and replaced by defaults, and the reset is reported in
/// [`LoadOrigin::Reset`] so the caller can log it.
pub fn load_json_or_default<T, F>(path: &Path, default: F) -> Result<Loaded<T>, ArchiveError>
where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> T,
{
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let value = default();
            write_json_atomic(path, &value)?;
            return Ok(Loaded {
                value,
                origin: LoadOrigin::Created,
            });
        }
        Err(e) => return Err(ArchiveError::io(path, e)),
    };

    match serde_json::from_slice::<T>(&bytes) {
        Ok(value) => Ok(Loaded {
            value,
            origin: LoadOrigin::Existing,
        }),
        Err(e) => {
            let quarantine = sibling(path, ".corrupt");
            fs::rename(path, &quarantine).map_err(io_at(path))?;
            let value = default();
            write_json_atomic(path, &value)?;
            Ok(Loaded {
                value,
                origin: LoadOrigin::Reset {
                    reason: e.to_string(),
                },
            })
        }
    }
}

#[cfg(unix)]
fn sync_parent_dir(path: &Path) -> Result<(), ArchiveError> {
    let parent = match path.parent().filter(|p| !p.as_os_str().is_empty()) {
        Some(parent) => parent,
        None => Path::new("."),
    };
    File::open(parent)
        .and_then(|dir| dir.sync_all())
        .map_err(io_at(parent))
}

#[cfg(not(unix))]
fn sync_parent_dir(_path: &Path) -> Result<(), ArchiveError> {
    Ok(())
}

/// Deserializes a counter that older state files may store as `null`.
pub fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
