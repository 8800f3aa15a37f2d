//! Configuration for the file-backed session store.
//!
//! ```toml
//! dir = "sessions"
//! create_table = true
//! table = "sessions"
//! backup_interval_ms = 60000
//! retry_limit = 100
//! retry_wait_ms = 100
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default directory holding one document per session.
pub const DEFAULT_DIR: &str = "sessions";

/// Default backing-store table name.
pub const DEFAULT_TABLE: &str = "sessions";

/// Default reconciliation period.
pub const DEFAULT_BACKUP_INTERVAL_MS: u64 = 60_000;

/// Default number of re-reads after a malformed document is observed.
pub const DEFAULT_RETRY_LIMIT: u32 = 100;

/// Default delay between re-reads.
pub const DEFAULT_RETRY_WAIT_MS: u64 = 100;

/// Configuration for [`FileBackedStore`](crate::FileBackedStore).
///
/// The backing-store handle is not part of the config; it is passed to
/// [`FileBackedStore::open`](crate::FileBackedStore::open) as a value
/// implementing [`BackingStore`](crate::BackingStore).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Cache root. Holds one JSON file per session plus the ledger.
    pub dir: PathBuf,

    /// Whether to ensure the backing-store table exists at startup.
    pub create_table: bool,

    /// Backing-store table name.
    pub table: String,

    /// Reconciliation period in milliseconds.
    pub backup_interval_ms: u64,

    /// Maximum re-reads of a malformed document before it is destroyed.
    pub retry_limit: u32,

    /// Delay between re-reads in milliseconds.
    pub retry_wait_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(DEFAULT_DIR),
            create_table: true,
            table: DEFAULT_TABLE.to_string(),
            backup_interval_ms: DEFAULT_BACKUP_INTERVAL_MS,
            retry_limit: DEFAULT_RETRY_LIMIT,
            retry_wait_ms: DEFAULT_RETRY_WAIT_MS,
        }
    }
}

impl StoreConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a configuration from a TOML fragment. Missing keys take defaults.
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config: Self = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    /// Set the cache root directory.
    pub fn with_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = dir.into();
        self
    }

    /// Enable or disable table creation at startup.
    pub fn with_create_table(mut self, enabled: bool) -> Self {
        self.create_table = enabled;
        self
    }

    /// Set the backing-store table name.
    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    /// Set the reconciliation period.
    pub fn with_backup_interval(mut self, interval: Duration) -> Self {
        self.backup_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set the maximum number of re-reads.
    pub fn with_retry_limit(mut self, limit: u32) -> Self {
        self.retry_limit = limit;
        self
    }

    /// Set the delay between re-reads.
    pub fn with_retry_wait(mut self, wait: Duration) -> Self {
        self.retry_wait_ms = wait.as_millis() as u64;
        self
    }

    /// Reconciliation period.
    pub fn backup_interval(&self) -> Duration {
        Duration::from_millis(self.backup_interval_ms)
    }

    /// Delay between re-reads.
    pub fn retry_wait(&self) -> Duration {
        Duration::from_millis(self.retry_wait_ms)
    }

    /// Check the configuration for values that cannot work at runtime.
    pub fn validate(&self) -> Result<()> {
        if self.dir.as_os_str().is_empty() {
            return Err(Error::InvalidConfig("dir must not be empty".to_string()));
        }
        if !is_sql_identifier(&self.table) {
            return Err(Error::InvalidConfig(format!(
                "table '{}' is not a plain SQL identifier",
                self.table
            )));
        }
        if self.backup_interval_ms == 0 {
            return Err(Error::InvalidConfig(
                "backup_interval_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// `[A-Za-z_][A-Za-z0-9_]*`, at most 64 chars.
pub fn is_sql_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    name.len() <= 64 && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
