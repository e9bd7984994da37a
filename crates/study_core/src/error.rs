//! crates/study_core/src/error.rs
//!
//! Errors surfaced at the orchestrator boundary. Each variant carries a stable
//! code that clients key on.

use crate::ports::PortError;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Prompt is {len} characters, the limit is {max}")]
    PromptTooLong { len: usize, max: usize },

    #[error("Too many files: {count} (limit {max})")]
    TooManyFiles { count: usize, max: usize },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Insufficient credits: balance {balance}, cost {cost}")]
    InsufficientCredits { balance: i64, cost: i64 },

    #[error("Model API key is not configured")]
    ModelKeyMissing,

    #[error("Server misconfigured: {0}")]
    Misconfigured(String),

    #[error("Model call timed out")]
    ModelTimeout,

    #[error("Model returned invalid structured output: {0}")]
    InvalidStructuredOutput(String),

    #[error("Model request failed: {0}")]
    ModelRequestFailed(String),

    #[error("Storage schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("Persistence failed: {0}")]
    Persistence(String),

    #[error("Charging credits failed: {0}")]
    ChargeFailed(String),
}

impl ServiceError {
    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::PromptTooLong { .. } => "PROMPT_TOO_LONG",
            ServiceError::TooManyFiles { .. } => "TOO_MANY_FILES",
            ServiceError::InvalidInput(_) => "INVALID_INPUT",
            ServiceError::NotFound(_) => "NOT_FOUND",
            ServiceError::InsufficientCredits { .. } => "INSUFFICIENT_CREDITS",
            ServiceError::ModelKeyMissing => "OPENAI_KEY_MISSING",
            ServiceError::Misconfigured(_) => "SERVER_MISCONFIGURED",
            ServiceError::ModelTimeout => "OPENAI_TIMEOUT",
            ServiceError::InvalidStructuredOutput(_) => "OPENAI_INVALID_STRUCTURED_OUTPUT",
            ServiceError::ModelRequestFailed(_) => "OPENAI_REQUEST_FAILED",
            ServiceError::SchemaMismatch(_) => "PLANS_SCHEMA_MISMATCH",
            ServiceError::Persistence(_) => "PERSISTENCE_FAILED",
            ServiceError::ChargeFailed(_) => "CHARGE_FAILED",
        }
    }

    /// Whether the user can reasonably try the same request again later.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            ServiceError::ModelTimeout
                | ServiceError::InvalidStructuredOutput(_)
                | ServiceError::ModelRequestFailed(_)
                | ServiceError::Persistence(_)
                | ServiceError::ChargeFailed(_)
        )
    }

    /// Maps a storage-port failure, keeping schema mismatches distinct.
    pub fn from_storage(err: PortError) -> Self {
        match err {
            PortError::SchemaMismatch(msg) => ServiceError::SchemaMismatch(msg),
            PortError::NotFound(msg) => ServiceError::NotFound(msg),
            other => ServiceError::Persistence(other.to_string()),
        }
    }

    /// Maps a model-port failure after retries are exhausted.
    pub fn from_model(err: PortError) -> Self {
        match err {
            PortError::NotConfigured(_) | PortError::Unauthorized => ServiceError::ModelKeyMissing,
            PortError::Timeout(_) => ServiceError::ModelTimeout,
            other => ServiceError::ModelRequestFailed(other.to_string()),
        }
    }
}
