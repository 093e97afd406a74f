use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Failure modes surfaced by the indexing and retrieval pipeline.
///
/// Service-level variants (`EmbeddingService`, `LlmService`) are transient
/// and safe to retry; everything else reflects bad input, bad state on
/// disk, or a bug, and retrying would not help.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("review {0} has no usable text after normalization")]
    EmptyInput(String),

    #[error("embedding dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("no chunks available to index for restaurant {0}")]
    EmptyIndex(String),

    #[error("no index found for restaurant {0}")]
    IndexNotFound(String),

    #[error("corrupt index for restaurant {restaurant_id}: {reason}")]
    CorruptIndex {
        restaurant_id: String,
        reason: String,
    },

    #[error("embedding service error: {0}")]
    EmbeddingService(String),

    #[error("llm service error: {0}")]
    LlmService(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("task failure: {0}")]
    Task(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

impl PipelineError {
    /// True for failures caused by a flaky external service, where a
    /// backoff-and-retry is worth attempting.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::EmbeddingService(_) | PipelineError::LlmService(_)
        )
    }
}
