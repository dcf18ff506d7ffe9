use thiserror::Error;

/// Result type for the ingestion, retrieval and generation entry points
pub type Result<T> = std::result::Result<T, RagError>;

/// Failures surfaced to whatever layer calls into the RAG core
#[derive(Debug, Error)]
pub enum RagError {
    /// The document could not be read or its format is unsupported
    #[error("failed to load document {file_name}: {source:#}")]
    Load {
        file_name: String,
        #[source]
        source: anyhow::Error,
    },

    /// Loading succeeded but there was no text to chunk
    #[error("document {0} produced no chunks")]
    EmptyDocument(String),

    /// The embedding backend failed or returned unusable vectors
    #[error("embedding failed: {0:#}")]
    Embedding(#[source] anyhow::Error),

    /// The vector index could not be reached or rejected the request
    #[error("vector index unavailable: {0:#}")]
    IndexUnavailable(#[source] anyhow::Error),

    /// An upsert batch was refused as a whole; `failed` lists the offending ordinals
    #[error("index rejected {} of {total} entries: {reason}", failed.len())]
    UpsertRejected {
        failed: Vec<usize>,
        total: usize,
        reason: String,
    },

    /// The language model call failed (rate limit, timeout, malformed response)
    #[error("generation failed: {0:#}")]
    Generation(#[source] anyhow::Error),

    #[error("conversation thread not found: {0}")]
    ThreadNotFound(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl RagError {
    pub fn load(file_name: impl Into<String>, source: anyhow::Error) -> Self {
        RagError::Load {
            file_name: file_name.into(),
            source,
        }
    }

    /// True for failures of an external backend (embedding, index, model)
    pub fn is_backend_failure(&self) -> bool {
        matches!(
            self,
            RagError::Embedding(_) | RagError::IndexUnavailable(_) | RagError::Generation(_)
        )
    }
}
