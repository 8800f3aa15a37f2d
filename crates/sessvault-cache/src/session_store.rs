//! Session store contract consumed by request-handling middleware.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::backing::BackingStore;
use crate::document::SessionDocument;
use crate::error::Result;
use crate::store::FileBackedStore;

/// Trait for session storage used by HTTP session middleware.
///
/// Documents returned by `get` carry the state they were read with, so a
/// `set` of the same value after mutation only applies what the caller
/// changed.
#[async_trait]
pub trait SessionStore: Send + Sync + 'static {
    /// Every session keyed by id.
    async fn all(&self) -> Result<BTreeMap<String, SessionDocument>>;

    /// Delete a session. Unknown ids are not an error.
    async fn destroy(&self, sid: &str) -> Result<()>;

    /// Delete every session.
    async fn clear(&self) -> Result<()>;

    /// Number of sessions.
    async fn length(&self) -> Result<usize>;

    /// Get a session. Returns `None` if it doesn't exist.
    async fn get(&self, sid: &str) -> Result<Option<SessionDocument>>;

    /// Create or update a session.
    async fn set(&self, sid: &str, session: &SessionDocument) -> Result<()>;

    /// Extend a session's expiry without changing its data.
    async fn touch(&self, sid: &str, session: &SessionDocument) -> Result<()>;
}

#[async_trait]
impl<B: BackingStore> SessionStore for FileBackedStore<B> {
    async fn all(&self) -> Result<BTreeMap<String, SessionDocument>> {
        FileBackedStore::all(self).await
    }

    async fn destroy(&self, sid: &str) -> Result<()> {
        FileBackedStore::destroy(self, sid).await
    }

    async fn clear(&self) -> Result<()> {
        FileBackedStore::clear(self).await
    }

    async fn length(&self) -> Result<usize> {
        FileBackedStore::length(self).await
    }

    async fn get(&self, sid: &str) -> Result<Option<SessionDocument>> {
        FileBackedStore::get(self, sid).await
    }

    async fn set(&self, sid: &str, session: &SessionDocument) -> Result<()> {
        FileBackedStore::set(self, sid, session).await
    }

    /// The stored document is authoritative; `session` is not consulted.
    async fn touch(&self, sid: &str, _session: &SessionDocument) -> Result<()> {
        FileBackedStore::touch(self, sid).await
    }
}
