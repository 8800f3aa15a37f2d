//! File-backed session store with asynchronous backing-store reconciliation.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use chrono::{TimeDelta, Utc};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, info, info_span, instrument, trace, warn};

use crate::backing::BackingStore;
use crate::cache::SessionCache;
use crate::config::StoreConfig;
use crate::diff;
use crate::document::{SessionDocument, validate_id};
use crate::error::{Error, Result};
use crate::ledger::{LedgerEntries, UpdateLedger};
use crate::locks::IdLocks;
use crate::reader::RetryingReader;
use crate::scheduler::{FlushOutcome, ReconcileStats, Reconciler};

/// What a startup load did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Rows written into the cache.
    pub loaded: usize,
    /// Rows left alone because the cache holds unreconciled changes.
    pub pending: usize,
    /// Rows with an unusable id or non-object data.
    pub invalid: usize,
    /// Cache documents no row or ledger entry knew about, marked dirty so
    /// the next cycle ships them.
    pub recovered: usize,
}

/// Populate `cache` from every row in `backing`.
///
/// Ids pending in `ledger` keep their cached document, since it is newer
/// than the row. Cached documents that neither the backing store nor the
/// ledger knows about were left by a failed flush or a crash before their
/// ledger mark; they are kept and marked dirty.
pub async fn bulk_load<B: BackingStore + ?Sized>(
    cache: &SessionCache,
    ledger: &UpdateLedger,
    backing: &B,
) -> Result<LoadReport> {
    let rows = backing.select_all().await?;
    let pending = ledger.pending().await;
    let mut report = LoadReport::default();
    let mut known = HashSet::with_capacity(rows.len());

    for row in rows {
        if let Err(e) = validate_id(&row.session_id) {
            warn!(error = %e, "Skipping backing-store row");
            report.invalid += 1;
            continue;
        }
        if pending.contains(&row.session_id) {
            known.insert(row.session_id);
            report.pending += 1;
            continue;
        }
        let doc = serde_json::from_str::<Value>(&row.data)
            .ok()
            .and_then(SessionDocument::from_value);
        let Some(doc) = doc else {
            warn!(session_id = %row.session_id, "Skipping backing-store row with non-object data");
            report.invalid += 1;
            continue;
        };
        cache.write(&row.session_id, &doc).await?;
        known.insert(row.session_id);
        report.loaded += 1;
    }

    for id in cache.ids().await? {
        if !known.contains(&id) && !pending.contains(&id) {
            debug!(session_id = %id, "Cached session missing from backing store, marking dirty");
            ledger.mark_dirty(&id).await?;
            report.recovered += 1;
        }
    }

    Ok(report)
}

struct StoreInner<B: BackingStore> {
    config: StoreConfig,
    cache: SessionCache,
    ledger: Arc<UpdateLedger>,
    reader: RetryingReader,
    reconciler: Arc<Reconciler<B>>,
    locks: Arc<IdLocks>,
    cancel: CancellationToken,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
    span: Span,
}

impl<B: BackingStore> Drop for StoreInner<B> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Write-back session store.
///
/// Reads and writes are served from one JSON document per session under the
/// configured directory. Every mutation is recorded in a persisted ledger,
/// and a background task periodically pushes the ledger's ids to the
/// backing store. Cloning is cheap; clones share one cache and one task.
pub struct FileBackedStore<B: BackingStore> {
    inner: Arc<StoreInner<B>>,
}

impl<B: BackingStore> Clone for FileBackedStore<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: BackingStore> FileBackedStore<B> {
    /// Open the store under a default `session_store` span.
    ///
    /// Must be called within a Tokio runtime.
    pub async fn open(config: StoreConfig, backing: B) -> Result<Self> {
        let span = info_span!(
            "session_store",
            dir = %config.dir.display(),
            table = %config.table
        );
        Self::open_with_span(config, backing, span).await
    }

    /// Open the store, running every operation and the reconciliation task
    /// inside `span`.
    ///
    /// Fails if the configuration is invalid, the backing store reports a
    /// table other than the configured one, the cache directory or ledger
    /// cannot be opened, or the backing store cannot create its table or be
    /// read. The store cannot serve sessions without the initial load.
    pub async fn open_with_span(config: StoreConfig, backing: B, span: Span) -> Result<Self> {
        config.validate()?;
        if let Some(table) = backing.table().filter(|t| *t != config.table) {
            return Err(Error::InvalidConfig(format!(
                "backing store uses table '{table}' but the configured table is '{}'",
                config.table
            )));
        }
        Self::open_inner(config, backing, span.clone())
            .instrument(span)
            .await
    }

    async fn open_inner(config: StoreConfig, backing: B, span: Span) -> Result<Self> {
        let cache = SessionCache::open(&config.dir).await?;
        let ledger = Arc::new(UpdateLedger::open(cache.ledger_path()).await?);
        let backing = Arc::new(backing);

        if config.create_table {
            backing.ensure_table().await?;
        }

        let report = bulk_load(&cache, &ledger, backing.as_ref()).await?;
        info!(
            loaded = report.loaded,
            pending = report.pending,
            invalid = report.invalid,
            recovered = report.recovered,
            "Loaded sessions from backing store"
        );

        let locks = Arc::new(IdLocks::default());
        let reader = RetryingReader::new(
            cache.clone(),
            ledger.clone(),
            config.retry_limit,
            config.retry_wait(),
        )
        .with_locks(Arc::clone(&locks));
        let reconciler = Arc::new(Reconciler::new(cache.clone(), ledger.clone(), backing));
        let cancel = CancellationToken::new();
        let task = reconciler.clone().spawn(
            config.backup_interval(),
            cancel.clone(),
            span.clone(),
        );

        Ok(Self {
            inner: Arc::new(StoreInner {
                config,
                cache,
                ledger,
                reader,
                reconciler,
                locks,
                cancel,
                task: parking_lot::Mutex::new(Some(task)),
                span,
            }),
        })
    }

    /// The configuration the store was opened with.
    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    /// Cache root directory.
    pub fn dir(&self) -> &Path {
        self.inner.cache.dir()
    }

    /// Read a session, attaching a snapshot for a later [`set`](Self::set).
    #[instrument(level = "debug", parent = &self.inner.span, skip_all, fields(session_id = %id))]
    pub async fn get(&self, id: &str) -> Result<Option<SessionDocument>> {
        let doc = self.inner.reader.read(id).await?;
        trace!(found = doc.is_some(), "get");
        Ok(doc.map(SessionDocument::with_snapshot))
    }

    /// Write a session.
    ///
    /// When `doc` carries the snapshot from `get`, only the fields changed
    /// since that snapshot are applied to the current document, so fields
    /// another writer changed meanwhile are kept. A document built without
    /// a snapshot replaces the stored one.
    #[instrument(level = "debug", parent = &self.inner.span, skip_all, fields(session_id = %id))]
    pub async fn set(&self, id: &str, doc: &SessionDocument) -> Result<()> {
        validate_id(id)?;
        let _guard = self.inner.locks.lock(id).await;

        let fields = match doc.snapshot() {
            Some(original) => {
                let current = self
                    .inner
                    .reader
                    .read_locked(id)
                    .await?
                    .map(SessionDocument::into_fields)
                    .unwrap_or_default();
                trace!("merging against snapshot");
                diff::merge(original, doc.fields(), current)
            }
            None => doc.fields().clone(),
        };

        self.inner
            .cache
            .write(id, &SessionDocument::from(fields))
            .await?;
        self.inner.ledger.mark_dirty(id).await?;
        Ok(())
    }

    /// Push `cookie.expires` to now plus `cookie.originalMaxAge`.
    ///
    /// Only the stored document is consulted; the caller's copy is not
    /// merged. Missing sessions and sessions without `originalMaxAge` are
    /// left untouched.
    #[instrument(level = "debug", parent = &self.inner.span, skip_all, fields(session_id = %id))]
    pub async fn touch(&self, id: &str) -> Result<()> {
        validate_id(id)?;
        let _guard = self.inner.locks.lock(id).await;

        let Some(mut doc) = self.inner.reader.read_locked(id).await? else {
            debug!("touch on missing session ignored");
            return Ok(());
        };
        let Some(max_age) = doc.cookie_original_max_age() else {
            debug!("session has no originalMaxAge, touch ignored");
            return Ok(());
        };
        let Some(expires) =
            TimeDelta::try_milliseconds(max_age).and_then(|d| Utc::now().checked_add_signed(d))
        else {
            warn!(max_age, "originalMaxAge out of range, touch ignored");
            return Ok(());
        };

        doc.set_cookie_expires(expires);
        self.inner.cache.write(id, &doc).await?;
        self.inner.ledger.mark_dirty(id).await?;
        Ok(())
    }

    /// Delete a session and mark it for removal from the backing store.
    #[instrument(level = "debug", parent = &self.inner.span, skip_all, fields(session_id = %id))]
    pub async fn destroy(&self, id: &str) -> Result<()> {
        validate_id(id)?;
        let _guard = self.inner.locks.lock(id).await;
        self.inner.cache.delete(id).await?;
        self.inner.ledger.mark_removed(id).await
    }

    /// Every readable session keyed by id.
    pub async fn all(&self) -> Result<BTreeMap<String, SessionDocument>> {
        self.inner
            .cache
            .enumerate()
            .instrument(self.inner.span.clone())
            .await
    }

    /// Number of cached sessions.
    pub async fn length(&self) -> Result<usize> {
        self.inner.cache.count().await
    }

    /// Delete every session and mark each for removal from the backing store.
    #[instrument(level = "debug", parent = &self.inner.span, skip_all)]
    pub async fn clear(&self) -> Result<()> {
        let _guards = self.inner.locks.lock_all().await;
        let removed = self.inner.cache.clear_all().await?;
        self.inner.ledger.mark_removed_all(&removed).await?;
        debug!(count = removed.len(), "Cleared sessions");
        Ok(())
    }

    /// Run a reconciliation cycle now.
    pub async fn flush(&self) -> Result<FlushOutcome> {
        self.inner
            .reconciler
            .run_cycle()
            .instrument(self.inner.span.clone())
            .await
    }

    /// Ids awaiting reconciliation.
    pub async fn pending(&self) -> LedgerEntries {
        self.inner.ledger.pending().await
    }

    /// Cumulative reconciliation counters.
    pub fn stats(&self) -> ReconcileStats {
        self.inner.reconciler.stats()
    }

    /// Stop the reconciliation task and flush what is pending.
    ///
    /// Request operations keep working afterwards, but nothing reaches the
    /// backing store unless [`flush`](Self::flush) is called.
    pub async fn shutdown(&self) -> Result<FlushOutcome> {
        self.inner.cancel.cancel();
        let task = self.inner.task.lock().take();
        if let Some(task) = task {
            task.await.map_err(|e| Error::Task(e.to_string()))?;
        }
        let outcome = self.flush().await?;
        info!(parent: &self.inner.span, ?outcome, "Session store shut down");
        Ok(outcome)
    }
}
