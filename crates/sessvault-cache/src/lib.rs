//! Write-back session cache.
//!
//! Sessions are served from one JSON document per id on local disk and
//! reconciled to a relational backing store in the background:
//! - Startup bulk load from the backing store
//! - Field-level diff-merge so concurrent writers don't clobber each other
//! - A persisted ledger of dirty/removed ids that survives restarts
//! - Periodic reconciliation: deletes first, then upserts of current values
//! - Bounded re-reads of documents observed mid-write
//!
//! # Example
//!
//! ```rust,ignore
//! use sessvault_cache::{FileBackedStore, MemoryBackingStore, StoreConfig};
//!
//! let config = StoreConfig::default()
//!     .with_dir("/var/lib/app/sessions")
//!     .with_backup_interval(Duration::from_secs(30));
//!
//! let store = FileBackedStore::open(config, MemoryBackingStore::new()).await?;
//! let mut session = store.get("sid").await?.unwrap_or_default();
//! session.insert("views", 1.into());
//! store.set("sid", &session).await?;
//! ```

mod backing;
mod cache;
mod config;
pub mod diff;
mod document;
mod error;
mod ledger;
mod locks;
mod reader;
mod scheduler;
mod session_store;
mod store;

pub use backing::{BackingRow, BackingStore, MemoryBackingStore, StoredSession};
pub use cache::{LEDGER_FILE, SessionCache};
pub use config::{StoreConfig, is_sql_identifier};
pub use document::{MAX_ID_LEN, SessionDocument, validate_id};
pub use error::{BoxError, Error, Result};
pub use ledger::{LedgerEntries, UpdateLedger};
pub use reader::RetryingReader;
pub use scheduler::{FlushOutcome, FlushReport, ReconcileStats, Reconciler};
pub use session_store::SessionStore;
pub use store::{FileBackedStore, LoadReport, bulk_load};
