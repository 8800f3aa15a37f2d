//! File-per-session document cache.
//!
//! Layout: `{dir}/{session_id}.json`, plus the ledger at `{dir}/.ledger.json`.
//! Every write goes to a dot-prefixed temp file in the same directory and is
//! renamed over the target, so a reader sees either the old or the new
//! document. Dot-prefixed names are never enumerated and never valid ids.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{trace, warn};

use crate::document::{SessionDocument, validate_id};
use crate::error::{Error, Result};

/// File name of the persisted ledger inside the cache directory.
pub const LEDGER_FILE: &str = ".ledger.json";

const DOC_EXT: &str = ".json";

static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Authoritative fast-path store: one JSON document per session id.
#[derive(Debug, Clone)]
pub struct SessionCache {
    dir: PathBuf,
}

impl SessionCache {
    /// Open the cache rooted at `dir`, creating the directory if needed.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::io(&dir, e))?;
        Ok(Self { dir })
    }

    /// Cache root.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the ledger file.
    pub fn ledger_path(&self) -> PathBuf {
        self.dir.join(LEDGER_FILE)
    }

    /// Path of the document for `id`.
    pub fn document_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}{DOC_EXT}"))
    }

    /// Read one document.
    ///
    /// Returns `Ok(None)` when no document exists. Content that does not parse
    /// as a JSON object is reported as [`Error::Corrupted`] with one attempt.
    pub async fn read(&self, id: &str) -> Result<Option<SessionDocument>> {
        validate_id(id)?;
        let path = self.document_path(id);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::io(path, e)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| Error::Corrupted {
                id: id.to_string(),
                attempts: 1,
                source,
            })
    }

    /// Replace the document for `id`.
    pub async fn write(&self, id: &str, doc: &SessionDocument) -> Result<()> {
        validate_id(id)?;
        let bytes = serde_json::to_vec(doc)?;
        write_atomic(&self.dir, &self.document_path(id), &bytes).await?;
        trace!(session_id = %id, bytes = bytes.len(), "Document written");
        Ok(())
    }

    /// Delete the document for `id`. Missing documents are not an error.
    pub async fn delete(&self, id: &str) -> Result<()> {
        validate_id(id)?;
        let path = self.document_path(id);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::io(path, e)),
        }
    }

    /// Ids of every cached document, sorted. Excludes the ledger and temp files.
    pub async fn ids(&self) -> Result<Vec<String>> {
        let mut entries = fs::read_dir(&self.dir)
            .await
            .map_err(|e| Error::io(&self.dir, e))?;
        let mut ids = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::io(&self.dir, e))?
        {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if let Some(id) = name.strip_suffix(DOC_EXT) {
                if validate_id(id).is_ok() {
                    ids.push(id.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Every readable document keyed by id.
    ///
    /// Documents that fail to parse are skipped; a later `get` on that id
    /// deals with them.
    pub async fn enumerate(&self) -> Result<BTreeMap<String, SessionDocument>> {
        let mut docs = BTreeMap::new();
        for id in self.ids().await? {
            match self.read(&id).await {
                Ok(Some(doc)) => {
                    docs.insert(id, doc);
                }
                Ok(None) => {}
                Err(Error::Corrupted { id, source, .. }) => {
                    warn!(session_id = %id, error = %source, "Skipping unreadable document");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(docs)
    }

    /// Number of cached documents.
    pub async fn count(&self) -> Result<usize> {
        Ok(self.ids().await?.len())
    }

    /// Delete every document and return the ids that were removed.
    pub async fn clear_all(&self) -> Result<Vec<String>> {
        let ids = self.ids().await?;
        for id in &ids {
            self.delete(id).await?;
        }
        Ok(ids)
    }
}

/// Write `bytes` to `target` through a temp file in `dir` and a rename.
pub(crate) async fn write_atomic(dir: &Path, target: &Path, bytes: &[u8]) -> Result<()> {
    let stem = target
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("doc");
    let seq = TEMP_SEQ.fetch_add(1, Ordering::Relaxed);
    let temp = dir.join(format!(".{stem}.{}.{seq}.tmp", std::process::id()));

    let result = async {
        let mut file = fs::File::create(&temp)
            .await
            .map_err(|e| Error::io(&temp, e))?;
        file.write_all(bytes)
            .await
            .map_err(|e| Error::io(&temp, e))?;
        file.sync_all().await.map_err(|e| Error::io(&temp, e))?;
        fs::rename(&temp, target)
            .await
            .map_err(|e| Error::io(target, e))
    }
    .await;

    if result.is_err() {
        let _ = fs::remove_file(&temp).await;
    }
    result
}
