use crate::validation::Rejection;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Retrieval unavailable: {0}")]
    RetrievalUnavailable(String),

    #[error("Generation failed: {0}")]
    GenerationFailed(String),

    #[error("Validation rejected: {0}")]
    ValidationRejected(Rejection),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Summarization degraded: {0}")]
    SummarizationDegraded(String),

    #[error("{stage} timed out after {timeout_ms}ms")]
    Timeout {
        stage: crate::pipeline::Stage,
        timeout_ms: u64,
    },

    #[error("{stage} cancelled")]
    Cancelled { stage: crate::pipeline::Stage },

    #[error("Metadata error: {0}")]
    Metadata(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("Vector index error: {0}")]
    Index(String),

    #[error("SQL error: {0}")]
    Sql(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("History error: {0}")]
    History(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Polars error: {0}")]
    Polars(String),
}

impl From<polars::prelude::PolarsError> for GatewayError {
    fn from(e: polars::prelude::PolarsError) -> Self {
        GatewayError::Polars(e.to_string())
    }
}

impl From<rusqlite::Error> for GatewayError {
    fn from(e: rusqlite::Error) -> Self {
        GatewayError::History(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
