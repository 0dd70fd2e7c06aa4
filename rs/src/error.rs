//! RowStore error types

use thiserror::Error;

/// Errors that can occur while opening or executing against the store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Empty statement")]
    EmptyStatement,

    #[error("Invalid row: {}", .0.join("; "))]
    Invalid(Vec<String>),
}
