//! SQLite backing store for the sessvault session cache.
//!
//! Stores one row per session in a single table:
//!
//! ```sql
//! CREATE TABLE IF NOT EXISTS sessions (
//!     session_id VARCHAR(128) PRIMARY KEY NOT NULL,
//!     expires    INTEGER NOT NULL,
//!     data       TEXT
//! );
//! ```

pub mod error;
pub mod store;

pub use error::{Result, SqliteStoreError};
pub use store::SqliteBackingStore;
