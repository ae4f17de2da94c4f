//! Error types for the chainarchive pipeline.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Errors raised by a [`Producer`](crate::producer::Producer).
#[derive(Debug, Clone, Error)]
pub enum ProducerError {
    /// Network hiccup, timeout, node still warming up. Safe to retry.
    #[error("transient producer error: {0}")]
    Transient(String),

    /// Bad credentials, malformed response, unknown method.
    #[error("producer error: {0}")]
    Fatal(String),
}

impl ProducerError {
    /// Returns `true` if the failed call may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Errors that can occur while archiving or indexing.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Producer(#[from] ProducerError),

    #[error("Checkpoint mismatch for '{entity}': {reason}")]
    CheckpointMismatch { entity: String, reason: String },

    #[error("Malformed record: {0}")]
    MalformedRecord(String),

    #[error("Shard artifact {} is unrecoverable: {reason}", path.display())]
    ShardUnrecoverable { path: PathBuf, reason: String },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl ArchiveError {
    /// Returns `true` only for transient producer failures.
    ///
    /// Everything else threatens durability or needs an operator, so the
    /// owning loop propagates it and the process exits.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Producer(e) if e.is_retryable())
    }

    /// Wraps an I/O error with the path it happened on.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// `map_err` adapter: `.map_err(io_at(&path))?`.
pub fn io_at(path: &Path) -> impl FnOnce(std::io::Error) -> ArchiveError + '_ {
    move |source| ArchiveError::io(path, source)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_producer_errors_retry() {
        let transient = ArchiveError::from(ProducerError::Transient("timeout".into()));
        let fatal = ArchiveError::from(ProducerError::Fatal("401".into()));
        let io = ArchiveError::io(
            "/tmp/x",
            std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
        );
        assert!(transient.is_retryable());
        assert!(!fatal.is_retryable());
        assert!(!io.is_retryable());
    }

    #[test]
    fn io_error_names_path() {
        let err = ArchiveError::io(
            "/data/txids_000000000_000009999.jsonl",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert!(err.to_string().contains("txids_000000000_000009999.jsonl"));
    }
}
