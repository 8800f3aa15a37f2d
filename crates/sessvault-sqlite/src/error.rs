use thiserror::Error;

#[derive(Debug, Error)]
pub enum SqliteStoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Invalid table name: {0}")]
    InvalidTable(String),

    #[error("Blocking task failed: {0}")]
    Join(String),
}

impl From<SqliteStoreError> for sessvault_cache::Error {
    fn from(err: SqliteStoreError) -> Self {
        sessvault_cache::Error::backing(err)
    }
}

pub type Result<T> = std::result::Result<T, SqliteStoreError>;
