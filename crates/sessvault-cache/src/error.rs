//! Error types for session store operations.

use std::path::PathBuf;

/// Boxed error produced by a backing-store adapter.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Error type for session store operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Filesystem failure on a cache document or the ledger.
    #[error("I/O error on '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Session id cannot be used as a cache key.
    #[error("Invalid session id '{id}': {reason}")]
    InvalidId { id: String, reason: &'static str },

    /// Document stayed malformed through every re-read and was destroyed.
    #[error("Session {id} is corrupted after {attempts} read attempts: {source}")]
    Corrupted {
        id: String,
        attempts: u32,
        source: serde_json::Error,
    },

    /// Persisted ledger could not be parsed at open.
    #[error("Ledger at '{}' is unreadable: {source}", path.display())]
    CorruptLedger {
        path: PathBuf,
        source: serde_json::Error,
    },

    /// Document could not be serialized.
    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Configuration rejected at construction.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Configuration file could not be parsed.
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Error from the backing store.
    #[error("Backing store error: {0}")]
    Backing(#[source] BoxError),

    /// Background task failed to complete.
    #[error("Task failed: {0}")]
    Task(String),
}

impl Error {
    /// Wrap an adapter error.
    pub fn backing(err: impl Into<BoxError>) -> Self {
        Self::Backing(err.into())
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Result type for session store operations.
pub type Result<T> = std::result::Result<T, Error>;
