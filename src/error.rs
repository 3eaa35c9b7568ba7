//! Error types for maskboard.

use thiserror::Error;

#[derive(Debug, Error)]
pub(crate) enum MaskError {
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("store not found: {0}")]
    StoreNotFound(String),

    #[error("record not found: {0}")]
    RecordNotFound(i64),

    #[error("comment not found: {0}")]
    CommentNotFound(i64),

    #[error("store already registered: {0}")]
    DuplicateStore(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("report text is empty")]
    EmptyReport,

    #[error("csv line {line}: {reason}")]
    Csv { line: usize, reason: String },

    #[error("server: {0}")]
    Server(String),
}

pub(crate) type Result<T, E = MaskError> = std::result::Result<T, E>;
