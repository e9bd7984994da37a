//! crates/study_core/src/ports.rs
//!
//! Defines the service contracts (traits) for the application's core logic.
//! These traits form the boundary of the hexagonal architecture, allowing the core
//! to be independent of specific external implementations like databases or APIs.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use uuid::Uuid;

use crate::document::StudyDocument;
use crate::domain::{
    ChargeEntry, ChargeState, ClaimWindow, Generation, LedgerOutcome, Material,
};

//=========================================================================================
// Generic Port Error and Result Types
//=========================================================================================

/// A generic error type for all port operations.
/// This abstracts away the specific errors from external services (e.g., database, network).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PortError {
    #[error("Item not found: {0}")]
    NotFound(String),
    #[error("An unexpected error occurred: {0}")]
    Unexpected(String),
    #[error("Unauthorized")]
    Unauthorized,
    #[error("The call timed out after {0:?}")]
    Timeout(Duration),
    #[error("Rate limited by upstream: {0}")]
    RateLimited(String),
    #[error("Upstream returned {status}: {message}")]
    Upstream { status: u16, message: String },
    #[error("Capability is not configured: {0}")]
    NotConfigured(String),
    #[error("Storage schema mismatch: {0}")]
    SchemaMismatch(String),
    #[error("Insufficient balance")]
    InsufficientBalance,
}

impl PortError {
    /// Errors worth a second attempt after a short pause.
    pub fn is_retryable(&self) -> bool {
        match self {
            PortError::Timeout(_) | PortError::RateLimited(_) => true,
            PortError::Upstream { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// A convenience type alias for `Result<T, PortError>`.
pub type PortResult<T> = Result<T, PortError>;

//=========================================================================================
// Storage Ports
//=========================================================================================

#[async_trait]
pub trait MaterialStore: Send + Sync {
    async fn insert_material(&self, material: Material) -> PortResult<Material>;

    /// All materials of a plan, oldest first.
    async fn list_materials(&self, user_id: Uuid, plan_id: Uuid) -> PortResult<Vec<Material>>;

    /// Atomically moves a claimable material to `processing` and stamps its lease.
    /// Returns `false` when another drain got there first or the row is no longer eligible.
    async fn claim_material(
        &self,
        user_id: Uuid,
        material_id: Uuid,
        window: ClaimWindow,
    ) -> PortResult<bool>;

    async fn mark_processed(
        &self,
        user_id: Uuid,
        material_id: Uuid,
        extracted_text: Option<String>,
    ) -> PortResult<()>;

    async fn mark_failed(&self, user_id: Uuid, material_id: Uuid, error: &str) -> PortResult<()>;

    /// `(user, plan)` pairs that still have claimable materials, oldest work first,
    /// skipping the first `offset` pairs.
    async fn list_pending_plans(
        &self,
        window: ClaimWindow,
        offset: usize,
        limit: usize,
    ) -> PortResult<Vec<(Uuid, Uuid)>>;
}

#[async_trait]
pub trait GenerationStore: Send + Sync {
    /// Inserts the audit row in `processing`, or resets an existing uncharged row to `processing`.
    async fn begin_generation(
        &self,
        user_id: Uuid,
        generation_id: Uuid,
        prompt: &str,
        language: &str,
    ) -> PortResult<Generation>;

    async fn get_generation(&self, user_id: Uuid, generation_id: Uuid) -> PortResult<Generation>;

    /// Stores the validated document and moves the row to `done`.
    async fn complete_generation(
        &self,
        user_id: Uuid,
        generation_id: Uuid,
        document: &StudyDocument,
    ) -> PortResult<()>;

    /// Records the amount charged on a `done` row.
    async fn record_charge(&self, user_id: Uuid, generation_id: Uuid, credits: i64)
        -> PortResult<()>;

    /// Moves the row to `failed` with an error code and a zero charge, dropping any document.
    async fn fail_generation(
        &self,
        user_id: Uuid,
        generation_id: Uuid,
        error_code: &str,
    ) -> PortResult<()>;
}

/// The per-user balance, owned by an external transactional store.
#[async_trait]
pub trait CreditLedger: Send + Sync {
    async fn get_balance(&self, user_id: Uuid) -> PortResult<i64>;

    /// Atomically debits `amount` unless the balance would go negative
    /// (`PortError::InsufficientBalance`). Replaying a key is a no-op.
    async fn charge(&self, user_id: Uuid, amount: i64, key: &str) -> PortResult<LedgerOutcome>;

    /// Credits back a previously applied charge with the same key.
    async fn refund(&self, user_id: Uuid, amount: i64, key: &str) -> PortResult<LedgerOutcome>;

    /// Adds purchased credits. Replaying a key is a no-op.
    async fn grant(&self, user_id: Uuid, amount: i64, key: &str) -> PortResult<LedgerOutcome>;
}

/// Durable log of the charge saga, one entry per `(user, generation)`.
#[async_trait]
pub trait ChargeJournal: Send + Sync {
    async fn find_charge(&self, user_id: Uuid, generation_id: Uuid)
        -> PortResult<Option<ChargeEntry>>;

    /// Returns the attempt number for the ledger key. An entry still in `intent` keeps its
    /// attempt; a refunded or unrefunded failure starts the next one.
    async fn record_intent(&self, user_id: Uuid, generation_id: Uuid, amount: i64)
        -> PortResult<u32>;

    async fn transition(
        &self,
        user_id: Uuid,
        generation_id: Uuid,
        state: ChargeState,
    ) -> PortResult<()>;
}

/// Keyed `user -> latest generation` pointer.
#[async_trait]
pub trait CurrentGenerationPointer: Send + Sync {
    async fn set_current_generation(&self, user_id: Uuid, generation_id: Uuid) -> PortResult<()>;

    async fn get_current_generation(&self, user_id: Uuid) -> PortResult<Option<Uuid>>;
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn upload(&self, path: &str, data: Bytes, content_type: &str) -> PortResult<String>;

    async fn download(&self, path: &str) -> PortResult<Bytes>;
}

//=========================================================================================
// Model Capability Ports
//=========================================================================================

/// An image passed inline to a model call.
#[derive(Debug, Clone)]
pub struct InlineImage {
    pub mime_type: String,
    pub data: Bytes,
}

/// One chat-style model invocation.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub system: String,
    pub user: String,
    pub images: Vec<InlineImage>,
    /// JSON schema the response must follow. `None` means free text.
    pub response_schema: Option<serde_json::Value>,
    pub max_tokens: u32,
    pub temperature: f32,
    pub timeout: Duration,
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Runs the completion and returns the raw content string.
    /// Implementations must give up after `request.timeout`.
    async fn complete(&self, request: CompletionRequest) -> PortResult<String>;
}

#[async_trait]
pub trait OcrService: Send + Sync {
    /// Reads text out of an image following `instruction`. An empty string is a valid answer.
    async fn recognize(
        &self,
        image: &[u8],
        mime_type: &str,
        instruction: &str,
        timeout: Duration,
    ) -> PortResult<String>;
}

#[async_trait]
pub trait PdfTextExtractor: Send + Sync {
    /// Extracts the embedded text layer of a PDF.
    async fn extract_text(&self, pdf: &[u8]) -> PortResult<String>;
}
