//! Striped per-id locks serializing writers of the same session.

use std::hash::{DefaultHasher, Hash, Hasher};

use tokio::sync::{Mutex, MutexGuard};

/// Number of lock stripes.
pub(crate) const LOCK_STRIPES: usize = 64;

/// Fixed set of async mutexes; an id always maps to the same one.
///
/// Two ids may share a stripe, so a holder must never take a second stripe
/// lock except through [`lock_all`](Self::lock_all).
#[derive(Debug)]
pub(crate) struct IdLocks {
    stripes: Box<[Mutex<()>]>,
}

impl IdLocks {
    pub(crate) fn new(stripes: usize) -> Self {
        Self {
            stripes: (0..stripes.max(1)).map(|_| Mutex::new(())).collect(),
        }
    }

    /// Lock the stripe owning `id`.
    pub(crate) async fn lock(&self, id: &str) -> MutexGuard<'_, ()> {
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        let stripe = (hasher.finish() as usize) % self.stripes.len();
        self.stripes[stripe].lock().await
    }

    /// Lock every stripe, in order.
    pub(crate) async fn lock_all(&self) -> Vec<MutexGuard<'_, ()>> {
        let mut guards = Vec::with_capacity(self.stripes.len());
        for stripe in self.stripes.iter() {
            guards.push(stripe.lock().await);
        }
        guards
    }
}

impl Default for IdLocks {
    fn default() -> Self {
        Self::new(LOCK_STRIPES)
    }
}
