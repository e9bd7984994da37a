//! services/api/src/web/protocol.rs
//!
//! Request and response payloads of the REST API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use study_core::document::StudyDocument;
use study_core::domain::{Generation, Material};
use study_core::generation::GenerationOutcome;
use study_core::ingestion::{IngestionStatus, KickReport, MaterialOutcome, MaterialStatusItem};
use utoipa::ToSchema;
use uuid::Uuid;

//=========================================================================================
// Materials
//=========================================================================================

/// Registers a file the client already uploaded to blob storage.
#[derive(Debug, Deserialize, ToSchema)]
pub struct RegisterMaterialRequest {
    /// Storage path, must start with `"{user_id}/"`.
    pub file_path: String,
    pub mime_type: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct MaterialResponse {
    pub id: Uuid,
    pub plan_id: Uuid,
    pub file_path: String,
    pub mime_type: String,
    /// One of `uploaded`, `processing`, `processed`, `failed`.
    pub status: String,
    pub created_at: DateTime<Utc>,
}

impl From<Material> for MaterialResponse {
    fn from(m: Material) -> Self {
        Self {
            id: m.id,
            plan_id: m.plan_id,
            file_path: m.file_path,
            mime_type: m.mime_type,
            status: m.status.as_str().to_string(),
            created_at: m.created_at,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct MaterialOutcomeDto {
    pub material_id: Uuid,
    pub status: String,
    pub error: Option<String>,
    pub attempts: u32,
}

impl From<MaterialOutcome> for MaterialOutcomeDto {
    fn from(o: MaterialOutcome) -> Self {
        Self {
            material_id: o.material_id,
            status: o.status.as_str().to_string(),
            error: o.error,
            attempts: o.attempts,
        }
    }
}

/// Result of draining a plan's materials.
#[derive(Debug, Serialize, ToSchema)]
pub struct KickResponse {
    pub ok: bool,
    pub processed_count: usize,
    pub failed_count: usize,
    pub items: Vec<MaterialOutcomeDto>,
}

impl From<KickReport> for KickResponse {
    fn from(r: KickReport) -> Self {
        Self {
            ok: r.ok,
            processed_count: r.processed_count,
            failed_count: r.failed_count,
            items: r.items.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct MaterialStatusDto {
    pub id: Uuid,
    pub status: String,
    pub error: Option<String>,
}

impl From<MaterialStatusItem> for MaterialStatusDto {
    fn from(i: MaterialStatusItem) -> Self {
        Self {
            id: i.id,
            status: i.status.as_str().to_string(),
            error: i.error,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct MaterialsStatusResponse {
    pub items: Vec<MaterialStatusDto>,
    pub total: usize,
    pub processed: usize,
    pub failed: usize,
    /// True once every material is `processed` or `failed`.
    pub settled: bool,
}

impl From<IngestionStatus> for MaterialsStatusResponse {
    fn from(s: IngestionStatus) -> Self {
        let settled = s.settled();
        Self {
            items: s.items.into_iter().map(Into::into).collect(),
            total: s.total,
            processed: s.processed,
            failed: s.failed,
            settled,
        }
    }
}

//=========================================================================================
// Generations
//=========================================================================================

#[derive(Debug, Deserialize, ToSchema)]
pub struct ImagePayload {
    pub mime_type: String,
    /// Standard base64, no `data:` prefix.
    pub data_base64: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct GenerateRequestBody {
    /// Client-chosen id. Replaying it never charges twice.
    pub generation_id: Option<Uuid>,
    pub prompt: String,
    /// `en`, `es` or `de`. Detected from the prompt when omitted.
    pub language: Option<String>,
    pub plan_id: Option<Uuid>,
    #[serde(default)]
    pub images: Vec<ImagePayload>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct GenerateResponse {
    pub generation_id: Uuid,
    #[schema(value_type = Object)]
    pub document: StudyDocument,
    pub credits_charged: i64,
    pub already_charged: bool,
}

impl From<GenerationOutcome> for GenerateResponse {
    fn from(o: GenerationOutcome) -> Self {
        Self {
            generation_id: o.generation_id,
            document: o.document,
            credits_charged: o.credits_charged,
            already_charged: o.already_charged,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct GenerationResponse {
    pub id: Uuid,
    /// One of `processing`, `done`, `failed`.
    pub status: String,
    pub prompt: String,
    pub language: String,
    #[schema(value_type = Option<Object>)]
    pub document: Option<StudyDocument>,
    pub credits_charged: i64,
    pub error_code: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<Generation> for GenerationResponse {
    fn from(g: Generation) -> Self {
        Self {
            id: g.id,
            status: g.status.as_str().to_string(),
            prompt: g.prompt,
            language: g.language,
            document: g.document,
            credits_charged: g.credits_charged,
            error_code: g.error_code,
            created_at: g.created_at,
        }
    }
}

//=========================================================================================
// Credits
//=========================================================================================

#[derive(Debug, Serialize, ToSchema)]
pub struct BalanceResponse {
    pub balance: i64,
}

/// Sent by the payment integration once a checkout completes.
#[derive(Debug, Deserialize, ToSchema)]
pub struct FulfillRequest {
    pub user_id: Uuid,
    pub credits: i64,
    pub checkout_id: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct FulfillResponse {
    /// False when this checkout had already been fulfilled.
    pub applied: bool,
    pub balance: i64,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
}
