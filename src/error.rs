use thiserror::Error;

use crate::embedder::EmbedderError;
use crate::llm::LlmError;

/// Errors surfaced by the storage ports and the RAG facade.
#[derive(Error, Debug)]
pub enum RagError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("embedding failed: {0}")]
    Embedding(#[from] EmbedderError),

    #[error("completion failed: {0}")]
    Llm(#[from] LlmError),

    #[error("malformed model output: {0}")]
    Parse(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("storages have been finalized")]
    Closed,
}

impl RagError {
    /// Whether this is the typed "not found" outcome.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, RagError::NotFound(_))
    }
}

pub type Result<T, E = RagError> = std::result::Result<T, E>;
