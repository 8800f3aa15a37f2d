//! Persisted record of ids changed since the last reconciliation.
//!
//! The ledger lives next to the documents as `.ledger.json`:
//!
//! ```json
//! {"mod": ["a", "b"], "removed": ["c"]}
//! ```
//!
//! Every mark rewrites the file before returning. Marks and drains take the
//! same lock, so a mark can never land between a drain's read and its reset.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::cache::write_atomic;
use crate::error::{Error, Result};

/// Ids pending reconciliation, in the order they were first marked.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntries {
    /// Ids whose current document must be upserted.
    #[serde(rename = "mod", default)]
    pub dirty: Vec<String>,

    /// Ids that must be deleted from the backing store.
    #[serde(default)]
    pub removed: Vec<String>,
}

impl LedgerEntries {
    /// True when nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.dirty.is_empty() && self.removed.is_empty()
    }

    /// True when `id` is pending in either set.
    pub fn contains(&self, id: &str) -> bool {
        self.dirty.iter().any(|d| d == id) || self.removed.iter().any(|r| r == id)
    }

    fn mark_dirty(&mut self, id: &str) -> bool {
        let was_removed = remove(&mut self.removed, id);
        let added = insert(&mut self.dirty, id);
        was_removed || added
    }

    fn mark_removed(&mut self, id: &str) -> bool {
        let was_dirty = remove(&mut self.dirty, id);
        let added = insert(&mut self.removed, id);
        was_dirty || added
    }
}

fn insert(set: &mut Vec<String>, id: &str) -> bool {
    if set.iter().any(|s| s == id) {
        return false;
    }
    set.push(id.to_string());
    true
}

fn remove(set: &mut Vec<String>, id: &str) -> bool {
    let before = set.len();
    set.retain(|s| s != id);
    set.len() != before
}

/// Dirty/removed id sets backed by a file.
#[derive(Debug)]
pub struct UpdateLedger {
    path: PathBuf,
    dir: PathBuf,
    entries: Mutex<LedgerEntries>,
}

impl UpdateLedger {
    /// Open the ledger at `path`, recovering entries left by a previous process.
    ///
    /// An unparseable ledger fails the open rather than silently dropping
    /// pending ids.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let entries = match tokio::fs::read(&path).await {
            Ok(bytes) if bytes.is_empty() => LedgerEntries::default(),
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|source| Error::CorruptLedger {
                path: path.clone(),
                source,
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => LedgerEntries::default(),
            Err(e) => return Err(Error::io(path, e)),
        };

        if !entries.is_empty() {
            debug!(
                dirty = entries.dirty.len(),
                removed = entries.removed.len(),
                "Recovered pending ledger entries"
            );
        }

        Ok(Self {
            path,
            dir,
            entries: Mutex::new(entries),
        })
    }

    /// Record that `id` has a new value to upsert.
    pub async fn mark_dirty(&self, id: &str) -> Result<()> {
        let mut entries = self.entries.lock().await;
        if entries.mark_dirty(id) {
            self.persist(&entries).await?;
            trace!(session_id = %id, "Marked dirty");
        }
        Ok(())
    }

    /// Record that `id` must be deleted from the backing store.
    pub async fn mark_removed(&self, id: &str) -> Result<()> {
        let mut entries = self.entries.lock().await;
        if entries.mark_removed(id) {
            self.persist(&entries).await?;
            trace!(session_id = %id, "Marked removed");
        }
        Ok(())
    }

    /// Mark many ids removed with a single write.
    pub async fn mark_removed_all(&self, ids: &[String]) -> Result<()> {
        let mut entries = self.entries.lock().await;
        let mut changed = false;
        for id in ids {
            changed |= entries.mark_removed(id);
        }
        if changed {
            self.persist(&entries).await?;
        }
        Ok(())
    }

    /// Take every pending entry and reset the ledger to empty.
    ///
    /// The reset is persisted before the entries are returned. If persisting
    /// fails the entries stay in place and the error is returned.
    pub async fn drain_and_clear(&self) -> Result<LedgerEntries> {
        let mut entries = self.entries.lock().await;
        if entries.is_empty() {
            return Ok(LedgerEntries::default());
        }
        self.persist(&LedgerEntries::default()).await?;
        Ok(std::mem::take(&mut *entries))
    }

    /// Copy of the pending entries.
    pub async fn pending(&self) -> LedgerEntries {
        self.entries.lock().await.clone()
    }

    /// Path of the ledger file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, entries: &LedgerEntries) -> Result<()> {
        let bytes = serde_json::to_vec(entries)?;
        write_atomic(&self.dir, &self.path, &bytes).await
    }
}
