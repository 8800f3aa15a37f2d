use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{Connection, params, params_from_iter};
use sessvault_cache::{BackingRow, BackingStore, StoreConfig, StoredSession, is_sql_identifier};
use tracing::debug;

use crate::{Result, SqliteStoreError};

/// Most ids bound into one `DELETE ... IN (...)` statement.
const DELETE_CHUNK: usize = 500;

/// Session table in a SQLite database.
///
/// Thread-safe via internal `Mutex<Connection>`. Queries run on the blocking
/// thread pool so they never stall the async runtime.
#[derive(Clone)]
pub struct SqliteBackingStore {
    conn: Arc<Mutex<Connection>>,
    table: Arc<str>,
}

impl SqliteBackingStore {
    /// Open (or create) the database at `path`, storing sessions in `table`.
    pub fn open(path: &Path, table: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::from_connection(conn, table)
    }

    /// Open (or create) the database at `path`, using the table named by
    /// `config`.
    pub fn open_with_config(path: &Path, config: &StoreConfig) -> Result<Self> {
        Self::open(path, &config.table)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory(table: &str) -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?, table)
    }

    /// Wrap an existing connection.
    pub fn from_connection(conn: Connection, table: &str) -> Result<Self> {
        if !is_sql_identifier(table) {
            return Err(SqliteStoreError::InvalidTable(table.to_string()));
        }
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            table: Arc::from(table),
        })
    }

    /// Table holding the sessions.
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection, &str) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let table = Arc::clone(&self.table);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock();
            f(&mut *conn, &*table)
        })
        .await
        .map_err(|e| SqliteStoreError::Join(e.to_string()))?
    }
}

fn create_table(conn: &mut Connection, table: &str) -> Result<()> {
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            session_id VARCHAR(128) PRIMARY KEY NOT NULL,
            expires INTEGER NOT NULL,
            data TEXT
        );"
    ))?;
    Ok(())
}

fn select_all(conn: &mut Connection, table: &str) -> Result<Vec<StoredSession>> {
    let mut stmt = conn.prepare(&format!("SELECT session_id, data FROM {table}"))?;
    let iter = stmt.query_map([], |row| {
        Ok(StoredSession {
            session_id: row.get(0)?,
            data: row
                .get::<_, Option<String>>(1)?
                .unwrap_or_else(|| "null".to_string()),
        })
    })?;

    let mut rows = Vec::new();
    for r in iter {
        rows.push(r?);
    }
    Ok(rows)
}

fn delete_many(conn: &mut Connection, table: &str, ids: &[String]) -> Result<()> {
    let tx = conn.transaction()?;
    for chunk in ids.chunks(DELETE_CHUNK) {
        let placeholders = vec!["?"; chunk.len()].join(", ");
        tx.execute(
            &format!("DELETE FROM {table} WHERE session_id IN ({placeholders})"),
            params_from_iter(chunk.iter()),
        )?;
    }
    tx.commit()?;
    Ok(())
}

fn upsert_many(conn: &mut Connection, table: &str, rows: &[BackingRow]) -> Result<()> {
    let tx = conn.transaction()?;
    {
        let mut stmt = tx.prepare(&format!(
            "INSERT INTO {table} (session_id, expires, data) VALUES (?1, ?2, ?3)
             ON CONFLICT(session_id) DO UPDATE SET expires = excluded.expires, data = excluded.data"
        ))?;
        for row in rows {
            let expires = i64::try_from(row.expires).unwrap_or(i64::MAX);
            stmt.execute(params![row.session_id, expires, row.data])?;
        }
    }
    tx.commit()?;
    Ok(())
}

#[async_trait]
impl BackingStore for SqliteBackingStore {
    fn table(&self) -> Option<&str> {
        Some(&*self.table)
    }

    async fn ensure_table(&self) -> sessvault_cache::Result<()> {
        self.with_conn(create_table).await?;
        debug!(table = %self.table, "Session table ready");
        Ok(())
    }

    async fn select_all(&self) -> sessvault_cache::Result<Vec<StoredSession>> {
        Ok(self.with_conn(select_all).await?)
    }

    async fn delete_many(&self, ids: &[String]) -> sessvault_cache::Result<()> {
        let ids = ids.to_vec();
        self.with_conn(move |conn, table| delete_many(conn, table, &ids))
            .await?;
        Ok(())
    }

    async fn upsert_many(&self, rows: &[BackingRow]) -> sessvault_cache::Result<()> {
        let rows = rows.to_vec();
        self.with_conn(move |conn, table| upsert_many(conn, table, &rows))
            .await?;
        Ok(())
    }
}
