use std::{path::PathBuf, time::Duration};

use crate::source::SourceType;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("empty input: source '{source_name}' has no text after normalization")]
    EmptyInput { source_name: String },

    #[error("decode error: could not read '{source_name}': {reason}")]
    Decode { source_name: String, reason: String },

    #[error("duplicate source: {source_type} '{source_name}' is already registered")]
    DuplicateSource {
        source_type: SourceType,
        source_name: String,
    },

    #[error("invalid chunk from '{source_name}': {reason}")]
    InvalidChunk { source_name: String, reason: String },

    #[error(
        "invalid weights: semantic={semantic}, keyword={keyword} (both must be >= 0 and not both zero)"
    )]
    InvalidWeight { semantic: f32, keyword: f32 },

    #[error("index not built: sources changed since the last build")]
    IndexNotBuilt,

    #[error("retrieval timeout: {stage} did not finish within {timeout:?}")]
    RetrievalTimeout {
        stage: &'static str,
        timeout: Duration,
    },

    #[error("embedding service error: {0}")]
    EmbeddingService(String),

    #[error("rerank service error: {0}")]
    RerankService(String),

    #[error("completion service error: {0}")]
    CompletionService(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("lexical index error: {0}")]
    Lexical(#[from] tantivy::TantivyError),

    #[error("tensor computation error: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error("database error: {0}")]
    Redb(#[from] redb::Error),

    #[error("database open error: {0}")]
    RedbDatabase(#[from] redb::DatabaseError),

    #[error("database storage error: {0}")]
    RedbStorage(#[from] redb::StorageError),

    #[error("database transaction error: {0}")]
    RedbTransaction(#[from] redb::TransactionError),

    #[error("database table error: {0}")]
    RedbTable(#[from] redb::TableError),

    #[error("database commit error: {0}")]
    RedbCommit(#[from] redb::CommitError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    #[error("data directory does not exist and could not be created: {0}")]
    DataDir(PathBuf),

    #[error("worker error: {0}")]
    Worker(String),
}

impl Error {
    /// True when an external model service failed or timed out, as opposed
    /// to a search that legitimately found nothing.
    pub fn is_service_failure(&self) -> bool {
        matches!(
            self,
            Error::EmbeddingService(_)
                | Error::RerankService(_)
                | Error::CompletionService(_)
                | Error::RetrievalTimeout { .. }
        )
    }
}
