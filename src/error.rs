//! Error types for evalq.
//!
//! Only run-level failures live here. A request that fails for one item is a
//! [`SubmitError`](crate::model::SubmitError) and ends up as a failure record,
//! never as an `Error`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("result already recorded for item {0}")]
    DuplicateResult(String),

    #[error("input error: {0}")]
    Input(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("worker task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
