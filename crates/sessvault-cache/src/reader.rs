//! Cache reads with bounded retry on malformed content.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, warn};

use crate::cache::SessionCache;
use crate::document::SessionDocument;
use crate::error::{Error, Result};
use crate::ledger::UpdateLedger;
use crate::locks::IdLocks;

/// Reads documents, re-reading after a fixed wait when one is observed
/// mid-write.
///
/// A document that is still malformed after `retry_limit` re-reads is
/// destroyed (deleted from the cache and marked removed) and the read fails
/// with [`Error::Corrupted`]. Any other failure is returned immediately.
///
/// The destroy step runs under the id's write lock and re-reads once first,
/// so a writer that replaced the document during the retry window wins.
#[derive(Debug, Clone)]
pub struct RetryingReader {
    cache: SessionCache,
    ledger: Arc<UpdateLedger>,
    locks: Arc<IdLocks>,
    retry_limit: u32,
    retry_wait: Duration,
}

impl RetryingReader {
    pub fn new(
        cache: SessionCache,
        ledger: Arc<UpdateLedger>,
        retry_limit: u32,
        retry_wait: Duration,
    ) -> Self {
        Self {
            cache,
            ledger,
            locks: Arc::new(IdLocks::default()),
            retry_limit,
            retry_wait,
        }
    }

    /// Share the write locks of the store this reader serves.
    pub(crate) fn with_locks(mut self, locks: Arc<IdLocks>) -> Self {
        self.locks = locks;
        self
    }

    /// Read with the configured retry limit.
    pub async fn read(&self, id: &str) -> Result<Option<SessionDocument>> {
        self.read_with_retries(id, self.retry_limit).await
    }

    /// Read allowing up to `retries` re-reads after the first attempt.
    pub async fn read_with_retries(
        &self,
        id: &str,
        retries: u32,
    ) -> Result<Option<SessionDocument>> {
        self.read_inner(id, retries, false).await
    }

    /// Read while the caller already holds `id`'s write lock.
    pub(crate) async fn read_locked(&self, id: &str) -> Result<Option<SessionDocument>> {
        self.read_inner(id, self.retry_limit, true).await
    }

    async fn read_inner(
        &self,
        id: &str,
        retries: u32,
        lock_held: bool,
    ) -> Result<Option<SessionDocument>> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.cache.read(id).await {
                Err(Error::Corrupted { source, .. }) => {
                    if attempt > retries {
                        let _guard = if lock_held {
                            None
                        } else {
                            let guard = self.locks.lock(id).await;
                            match self.cache.read(id).await {
                                Err(Error::Corrupted { .. }) => {}
                                other => return other,
                            }
                            Some(guard)
                        };
                        error!(
                            session_id = %id,
                            attempts = attempt,
                            error = %source,
                            "Document unreadable after retries, destroying"
                        );
                        self.cache.delete(id).await?;
                        self.ledger.mark_removed(id).await?;
                        return Err(Error::Corrupted {
                            id: id.to_string(),
                            attempts: attempt,
                            source,
                        });
                    }
                    warn!(
                        session_id = %id,
                        attempt,
                        max_retries = retries,
                        wait_ms = self.retry_wait.as_millis() as u64,
                        "Malformed document, retrying"
                    );
                    tokio::time::sleep(self.retry_wait).await;
                }
                other => return other,
            }
        }
    }
}
