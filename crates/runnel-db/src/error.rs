//! Store error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate: {0}")]
    Duplicate(String),

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("store file I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store file encoding error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type DbResult<T> = std::result::Result<T, DbError>;
