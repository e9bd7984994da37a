//! crates/study_core/src/domain.rs
//!
//! Defines the pure, core data structures for the application.
//! These structs are independent of any database or transport format.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::document::StudyDocument;

//=========================================================================================
// Materials
//=========================================================================================

/// Where a Material sits in the extraction state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaterialStatus {
    Uploaded,
    Processing,
    Processed,
    Failed,
}

impl MaterialStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MaterialStatus::Uploaded => "uploaded",
            MaterialStatus::Processing => "processing",
            MaterialStatus::Processed => "processed",
            MaterialStatus::Failed => "failed",
        }
    }

    /// Parses the stored representation. Unknown values are treated as `Uploaded`
    /// so the row gets picked up and rewritten by the next drain.
    pub fn parse(s: &str) -> Self {
        match s {
            "processing" => MaterialStatus::Processing,
            "processed" => MaterialStatus::Processed,
            "failed" => MaterialStatus::Failed,
            _ => MaterialStatus::Uploaded,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, MaterialStatus::Processed | MaterialStatus::Failed)
    }
}

/// One uploaded source file tracked through extraction.
#[derive(Debug, Clone)]
pub struct Material {
    pub id: Uuid,
    pub user_id: Uuid,
    pub plan_id: Uuid,
    pub file_path: String,
    pub mime_type: String,
    pub status: MaterialStatus,
    /// Only ever `Some` while `status == Processed`.
    pub extracted_text: Option<String>,
    /// Always `Some` while `status == Failed`.
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Last status transition. Doubles as the processing lease stamp.
    pub updated_at: DateTime<Utc>,
}

impl Material {
    /// Creates a freshly registered material in the `uploaded` state.
    pub fn new_uploaded(user_id: Uuid, plan_id: Uuid, file_path: &str, mime_type: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id,
            plan_id,
            file_path: file_path.to_string(),
            mime_type: mime_type.to_string(),
            status: MaterialStatus::Uploaded,
            extracted_text: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_image(&self) -> bool {
        crate::extraction::MaterialKind::infer(&self.mime_type, &self.file_path)
            == crate::extraction::MaterialKind::Image
    }

    /// Whether a drain may claim this material right now.
    pub fn is_claimable(&self, window: &ClaimWindow) -> bool {
        match self.status {
            MaterialStatus::Uploaded => true,
            MaterialStatus::Failed => self.updated_at <= window.failed_before,
            MaterialStatus::Processing => self.updated_at <= window.stale_before,
            MaterialStatus::Processed => false,
        }
    }
}

/// Cut-off timestamps that decide which non-`uploaded` materials can be claimed again.
#[derive(Debug, Clone, Copy)]
pub struct ClaimWindow {
    /// `failed` rows last touched at or before this instant are retried.
    pub failed_before: DateTime<Utc>,
    /// `processing` rows whose lease was stamped at or before this instant are reclaimed.
    pub stale_before: DateTime<Utc>,
}

impl ClaimWindow {
    pub fn at(now: DateTime<Utc>, failed_cooldown: Duration, processing_lease: Duration) -> Self {
        Self {
            failed_before: now - failed_cooldown,
            stale_before: now - processing_lease,
        }
    }
}

//=========================================================================================
// Generations
//=========================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationStatus {
    Processing,
    Done,
    Failed,
}

impl GenerationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GenerationStatus::Processing => "processing",
            GenerationStatus::Done => "done",
            GenerationStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "done" => GenerationStatus::Done,
            "failed" => GenerationStatus::Failed,
            _ => GenerationStatus::Processing,
        }
    }
}

/// The persisted output of one generation request plus its billing metadata.
#[derive(Debug, Clone)]
pub struct Generation {
    pub id: Uuid,
    pub user_id: Uuid,
    pub prompt: String,
    pub language: String,
    pub document: Option<StudyDocument>,
    pub status: GenerationStatus,
    /// Positive only once `status == Done`.
    pub credits_charged: i64,
    pub error_code: Option<String>,
    pub created_at: DateTime<Utc>,
}

//=========================================================================================
// Credits
//=========================================================================================

/// Result of a keyed ledger mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerOutcome {
    /// The balance was changed by this call.
    Applied,
    /// A mutation with the same key had already been applied; the balance is unchanged.
    AlreadyApplied,
    /// Nothing to do (e.g. refunding a key that was never charged).
    Skipped,
}

/// Saga state for one generation's charge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChargeState {
    Intent,
    Charged,
    Refunded,
    RefundFailed,
}

impl ChargeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChargeState::Intent => "intent",
            ChargeState::Charged => "charged",
            ChargeState::Refunded => "refunded",
            ChargeState::RefundFailed => "refund_failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "charged" => ChargeState::Charged,
            "refunded" => ChargeState::Refunded,
            "refund_failed" => ChargeState::RefundFailed,
            _ => ChargeState::Intent,
        }
    }
}

/// One row of the charge journal.
#[derive(Debug, Clone)]
pub struct ChargeEntry {
    pub generation_id: Uuid,
    pub user_id: Uuid,
    pub amount: i64,
    pub state: ChargeState,
    /// Numbers the ledger key; bumped each time a settled charge is retried.
    pub attempt: u32,
    pub updated_at: DateTime<Utc>,
}
