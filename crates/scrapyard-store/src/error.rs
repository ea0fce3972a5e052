use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Could not determine application data directory")]
    NoDataDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Record not found")]
    NotFound,

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Table '{0}' is not CRDT-tracked")]
    Untracked(String),

    #[error("Table '{table}' cannot be CRDT-tracked: {reason}")]
    UnsupportedSchema { table: String, reason: String },

    #[error("Malformed change record: {0}")]
    BadChange(String),

    #[error("Timestamp parse error: {0}")]
    ChronoParse(#[from] chrono::ParseError),
}

pub type Result<T> = std::result::Result<T, StoreError>;
