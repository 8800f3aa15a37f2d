//! Backing-store abstraction.
//!
//! The relational store is the system of record across restarts. The cache
//! talks to it through four calls: ensure the table, select every row,
//! delete by id list, and upsert by id list.
//!
//! ```text
//! BackingStore (trait)
//!     └── SqliteBackingStore   - sessvault-sqlite crate
//!     └── MemoryBackingStore   - in-process map for tests and embedding
//! ```

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::Result;

/// A row as read back at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredSession {
    pub session_id: String,
    /// Serialized JSON object.
    pub data: String,
}

/// A row as written by reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackingRow {
    pub session_id: String,
    /// Expiry in epoch seconds.
    pub expires: u64,
    /// Serialized JSON object.
    pub data: String,
}

/// Trait for the relational store behind the cache.
///
/// Implementations own their connection handling and timeouts. Upserts are
/// last-writer-wins per row.
#[async_trait]
pub trait BackingStore: Send + Sync + 'static {
    /// Table the adapter reads and writes, if it is bound to one.
    ///
    /// The store refuses to open when this differs from the configured
    /// table.
    fn table(&self) -> Option<&str> {
        None
    }

    /// Create the session table if it does not exist.
    async fn ensure_table(&self) -> Result<()>;

    /// Every stored session.
    async fn select_all(&self) -> Result<Vec<StoredSession>>;

    /// Delete the rows for `ids`. Unknown ids are ignored.
    async fn delete_many(&self, ids: &[String]) -> Result<()>;

    /// Insert or update each row keyed by `session_id`.
    async fn upsert_many(&self, rows: &[BackingRow]) -> Result<()>;
}

/// Backing store held in process memory.
#[derive(Debug, Default)]
pub struct MemoryBackingStore {
    rows: Mutex<BTreeMap<String, BackingRow>>,
}

impl MemoryBackingStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store holding `rows`.
    pub fn with_rows(rows: impl IntoIterator<Item = BackingRow>) -> Self {
        let store = Self::new();
        {
            let mut map = store.rows.lock();
            for row in rows {
                map.insert(row.session_id.clone(), row);
            }
        }
        store
    }

    /// Copy of one row.
    pub fn row(&self, id: &str) -> Option<BackingRow> {
        self.rows.lock().get(id).cloned()
    }

    /// Copy of every row, keyed by id.
    pub fn rows(&self) -> BTreeMap<String, BackingRow> {
        self.rows.lock().clone()
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.lock().len()
    }

    /// True when the store holds no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.lock().is_empty()
    }
}

#[async_trait]
impl BackingStore for MemoryBackingStore {
    async fn ensure_table(&self) -> Result<()> {
        Ok(())
    }

    async fn select_all(&self) -> Result<Vec<StoredSession>> {
        Ok(self
            .rows
            .lock()
            .values()
            .map(|row| StoredSession {
                session_id: row.session_id.clone(),
                data: row.data.clone(),
            })
            .collect())
    }

    async fn delete_many(&self, ids: &[String]) -> Result<()> {
        let mut rows = self.rows.lock();
        for id in ids {
            rows.remove(id);
        }
        Ok(())
    }

    async fn upsert_many(&self, rows: &[BackingRow]) -> Result<()> {
        let mut map = self.rows.lock();
        for row in rows {
            map.insert(row.session_id.clone(), row.clone());
        }
        Ok(())
    }
}
