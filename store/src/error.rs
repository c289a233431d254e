use std::io;

/// Categorized failure modes surfaced by the store (see the error taxonomy
/// this crate implements).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("could not lock store file within {timeout}s ({msg})")]
    LockFailure { timeout: f64, msg: String },

    #[error("integrity failure: {0}")]
    IntegrityFailure(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("sql error: {0}")]
    Sql(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("config (de)serialization error: {0}")]
    Config(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;
