//! Periodic reconciliation of the ledger into the backing store.
//!
//! One cycle: drain the ledger, delete removed ids, then re-read each dirty
//! id from the cache and upsert what is still there. Deletes run before
//! upserts so an id removed and re-created in the same window ends up
//! present. The ledger is cleared before the backing store is called; a
//! failed call is logged and counted in [`ReconcileStats`] but its ids are
//! not retried until they are mutated again.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, error, info, warn};

use crate::backing::{BackingRow, BackingStore};
use crate::cache::SessionCache;
use crate::error::{Error, Result};
use crate::ledger::{LedgerEntries, UpdateLedger};

/// Result of one call to [`Reconciler::run_cycle`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Another cycle was already in flight; nothing was done.
    Busy,
    /// The ledger was empty.
    Idle,
    /// The backing store was updated.
    Flushed(FlushReport),
}

/// What a completed cycle pushed to the backing store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Ids sent in the bulk delete.
    pub deleted: usize,
    /// Rows sent in the bulk upsert.
    pub upserted: usize,
    /// Dirty ids no longer readable in the cache.
    pub skipped: usize,
}

/// Cumulative reconciliation counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    /// Cycles that found pending entries.
    pub cycles: u64,
    /// Ids deleted from the backing store.
    pub deleted: u64,
    /// Rows upserted into the backing store.
    pub upserted: u64,
    /// Cycles where a backing-store call failed.
    pub failed_cycles: u64,
    /// Ids whose changes were lost to a failed call.
    pub dropped_ids: u64,
}

#[derive(Debug, Default)]
struct Counters {
    cycles: AtomicU64,
    deleted: AtomicU64,
    upserted: AtomicU64,
    failed_cycles: AtomicU64,
    dropped_ids: AtomicU64,
}

/// Clears the in-flight flag when a cycle ends, however it ends.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Drains the ledger into the backing store.
pub struct Reconciler<B: BackingStore> {
    cache: SessionCache,
    ledger: Arc<UpdateLedger>,
    backing: Arc<B>,
    flushing: AtomicBool,
    counters: Counters,
}

impl<B: BackingStore> Reconciler<B> {
    pub fn new(cache: SessionCache, ledger: Arc<UpdateLedger>, backing: Arc<B>) -> Self {
        Self {
            cache,
            ledger,
            backing,
            flushing: AtomicBool::new(false),
            counters: Counters::default(),
        }
    }

    /// Snapshot of the cumulative counters.
    pub fn stats(&self) -> ReconcileStats {
        let c = &self.counters;
        ReconcileStats {
            cycles: c.cycles.load(Ordering::Relaxed),
            deleted: c.deleted.load(Ordering::Relaxed),
            upserted: c.upserted.load(Ordering::Relaxed),
            failed_cycles: c.failed_cycles.load(Ordering::Relaxed),
            dropped_ids: c.dropped_ids.load(Ordering::Relaxed),
        }
    }

    /// Run one reconciliation cycle unless one is already running.
    ///
    /// Backing-store failures are logged, counted, and returned. The drained
    /// entries are not put back.
    pub async fn run_cycle(&self) -> Result<FlushOutcome> {
        if self
            .flushing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Reconciliation already in flight, skipping");
            return Ok(FlushOutcome::Busy);
        }
        let _in_flight = InFlight(&self.flushing);

        let entries = self.ledger.drain_and_clear().await?;
        if entries.is_empty() {
            return Ok(FlushOutcome::Idle);
        }
        self.counters.cycles.fetch_add(1, Ordering::Relaxed);

        let report = self.push(entries).await?;
        info!(
            deleted = report.deleted,
            upserted = report.upserted,
            skipped = report.skipped,
            "Reconciled sessions to backing store"
        );
        Ok(FlushOutcome::Flushed(report))
    }

    async fn push(&self, entries: LedgerEntries) -> Result<FlushReport> {
        let mut report = FlushReport::default();
        let mut first_error = None;

        if !entries.removed.is_empty() {
            match self.backing.delete_many(&entries.removed).await {
                Ok(()) => {
                    report.deleted = entries.removed.len();
                    self.counters
                        .deleted
                        .fetch_add(report.deleted as u64, Ordering::Relaxed);
                }
                Err(e) => {
                    self.record_failure("delete", entries.removed.len(), &e);
                    first_error = Some(e);
                }
            }
        }

        let mut rows = Vec::with_capacity(entries.dirty.len());
        for id in &entries.dirty {
            match self.cache.read(id).await {
                Ok(Some(doc)) => rows.push(BackingRow {
                    session_id: id.clone(),
                    expires: doc.expires_epoch_secs(),
                    data: serde_json::to_string(&doc)?,
                }),
                Ok(None) => report.skipped += 1,
                Err(e) => {
                    warn!(session_id = %id, error = %e, "Dirty session unreadable, not upserted");
                    report.skipped += 1;
                }
            }
        }

        if !rows.is_empty() {
            match self.backing.upsert_many(&rows).await {
                Ok(()) => {
                    report.upserted = rows.len();
                    self.counters
                        .upserted
                        .fetch_add(report.upserted as u64, Ordering::Relaxed);
                }
                Err(e) => {
                    self.record_failure("upsert", rows.len(), &e);
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => {
                self.counters.failed_cycles.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
            None => Ok(report),
        }
    }

    fn record_failure(&self, call: &'static str, ids: usize, err: &Error) {
        self.counters
            .dropped_ids
            .fetch_add(ids as u64, Ordering::Relaxed);
        error!(
            call,
            dropped = ids,
            error = %err,
            "Backing store call failed; changes wait until the sessions change again or the store restarts"
        );
    }
}

impl<B: BackingStore> Reconciler<B> {
    /// Run cycles every `period` until `cancel` fires.
    ///
    /// The first cycle runs one period after spawning. Ticks missed while a
    /// cycle is running are skipped rather than queued.
    pub fn spawn(
        self: Arc<Self>,
        period: Duration,
        cancel: CancellationToken,
        span: Span,
    ) -> JoinHandle<()> {
        let task = async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            debug!(period_ms = period.as_millis() as u64, "Reconciliation task started");

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        // Failures are already logged and counted.
                        let _ = self.run_cycle().await;
                    }
                }
            }
            debug!("Reconciliation task stopped");
        };
        tokio::spawn(task.instrument(span))
    }
}
