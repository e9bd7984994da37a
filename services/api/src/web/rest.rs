//! services/api/src/web/rest.rs
//!
//! Contains the Axum handlers for the REST API endpoints and the master
//! definition for the OpenAPI specification.

use std::sync::Arc;

use axum::{
    extract::{Multipart, Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json},
    Extension,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use study_core::domain::LedgerOutcome;
use study_core::error::ServiceError;
use study_core::generation::GenerateRequest;
use study_core::ports::InlineImage;
use tracing::info;
use utoipa::OpenApi;
use uuid::Uuid;

use crate::error::{ApiError, ErrorBody};
use crate::web::protocol::*;
use crate::web::state::{AppState, CurrentUser};

pub const FULFILLMENT_SECRET_HEADER: &str = "x-fulfillment-secret";

//=========================================================================================
// OpenAPI Master Definition
//=========================================================================================

#[derive(OpenApi)]
#[openapi(
    paths(
        health_handler,
        register_material_handler,
        upload_material_handler,
        kick_handler,
        materials_status_handler,
        generate_handler,
        current_generation_handler,
        get_generation_handler,
        balance_handler,
        fulfill_handler,
    ),
    components(
        schemas(
            RegisterMaterialRequest, MaterialResponse, KickResponse, MaterialOutcomeDto,
            MaterialsStatusResponse, MaterialStatusDto, GenerateRequestBody, ImagePayload,
            GenerateResponse, GenerationResponse, BalanceResponse, FulfillRequest,
            FulfillResponse, HealthResponse, ErrorBody
        )
    ),
    tags(
        (name = "Study Plan API", description = "Material ingestion, study-plan generation and credits.")
    )
)]
pub struct ApiDoc;

//=========================================================================================
// Health
//=========================================================================================

#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, description = "Service is up", body = HealthResponse))
)]
pub async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok".to_string() })
}

//=========================================================================================
// Materials
//=========================================================================================

/// Register a material the client already put into blob storage.
#[utoipa::path(
    post,
    path = "/plans/{plan_id}/materials",
    request_body = RegisterMaterialRequest,
    responses(
        (status = 201, description = "Material registered", body = MaterialResponse),
        (status = 400, description = "Path outside the caller's prefix or too many files", body = ErrorBody),
        (status = 401, description = "Missing x-user-id", body = ErrorBody)
    ),
    params(
        ("plan_id" = Uuid, Path, description = "The study plan the material belongs to."),
        ("x-user-id" = Uuid, Header, description = "The unique ID of the user.")
    )
)]
pub async fn register_material_handler(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user_id)): Extension<CurrentUser>,
    Path(plan_id): Path<Uuid>,
    Json(body): Json<RegisterMaterialRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if body.mime_type.trim().is_empty() {
        return Err(ApiError::BadRequest("mime_type must not be empty".to_string()));
    }
    let material = state
        .ingestion
        .register(user_id, plan_id, &body.file_path, &body.mime_type)
        .await?;
    Ok((StatusCode::CREATED, Json(MaterialResponse::from(material))))
}

/// Upload a file through the server and register it.
///
/// Accepts a multipart/form-data request with a single file part.
#[utoipa::path(
    post,
    path = "/plans/{plan_id}/materials/upload",
    request_body(content_type = "multipart/form-data", description = "The file to upload."),
    responses(
        (status = 201, description = "Material stored and registered", body = MaterialResponse),
        (status = 400, description = "Missing file or too many files", body = ErrorBody),
        (status = 401, description = "Missing x-user-id", body = ErrorBody)
    ),
    params(
        ("plan_id" = Uuid, Path, description = "The study plan the material belongs to."),
        ("x-user-id" = Uuid, Header, description = "The unique ID of the user.")
    )
)]
pub async fn upload_material_handler(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user_id)): Extension<CurrentUser>,
    Path(plan_id): Path<Uuid>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    let field = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("Failed to read multipart data: {}", e)))?
        .ok_or_else(|| ApiError::BadRequest("Multipart form must include a file".to_string()))?;

    let file_name = sanitize_file_name(field.file_name().unwrap_or("upload.bin"));
    let mime_type = field
        .content_type()
        .map(str::to_string)
        .unwrap_or_else(|| "application/octet-stream".to_string());
    let data = field
        .bytes()
        .await
        .map_err(|e| ApiError::BadRequest(format!("Failed to read file bytes: {}", e)))?;
    if data.is_empty() {
        return Err(ApiError::BadRequest("Uploaded file is empty".to_string()));
    }

    // Refuse before writing a blob nobody could register.
    state
        .ingestion
        .ensure_capacity(user_id, plan_id, &file_name, &mime_type)
        .await?;

    let path = format!("{}/{}/{}-{}", user_id, plan_id, Uuid::new_v4(), file_name);
    let stored_path = state.blobs.upload(&path, data, &mime_type).await?;
    let material = state
        .ingestion
        .register(user_id, plan_id, &stored_path, &mime_type)
        .await?;
    Ok((StatusCode::CREATED, Json(MaterialResponse::from(material))))
}

/// Drain every claimable material of a plan. Safe to call repeatedly.
#[utoipa::path(
    post,
    path = "/plans/{plan_id}/kick",
    responses(
        (status = 200, description = "Per-material outcomes", body = KickResponse),
        (status = 400, description = "Plan exceeds the file or image limit", body = ErrorBody)
    ),
    params(
        ("plan_id" = Uuid, Path, description = "The study plan to drain."),
        ("x-user-id" = Uuid, Header, description = "The unique ID of the user.")
    )
)]
pub async fn kick_handler(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user_id)): Extension<CurrentUser>,
    Path(plan_id): Path<Uuid>,
) -> Result<Json<KickResponse>, ApiError> {
    let report = state.ingestion.kick(user_id, plan_id).await?;
    Ok(Json(report.into()))
}

#[utoipa::path(
    get,
    path = "/plans/{plan_id}/materials/status",
    responses((status = 200, description = "Material states of the plan", body = MaterialsStatusResponse)),
    params(
        ("plan_id" = Uuid, Path, description = "The study plan to inspect."),
        ("x-user-id" = Uuid, Header, description = "The unique ID of the user.")
    )
)]
pub async fn materials_status_handler(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user_id)): Extension<CurrentUser>,
    Path(plan_id): Path<Uuid>,
) -> Result<Json<MaterialsStatusResponse>, ApiError> {
    let status = state.ingestion.status(user_id, plan_id).await?;
    Ok(Json(status.into()))
}

//=========================================================================================
// Generations
//=========================================================================================

/// Generate a study plan and charge for it.
#[utoipa::path(
    post,
    path = "/generations",
    request_body = GenerateRequestBody,
    responses(
        (status = 200, description = "Validated study document", body = GenerateResponse),
        (status = 400, description = "Prompt too long, too many files or bad input", body = ErrorBody),
        (status = 402, description = "Not enough credits", body = ErrorBody),
        (status = 500, description = "Model or storage failure; see `retriable`", body = ErrorBody)
    ),
    params(("x-user-id" = Uuid, Header, description = "The unique ID of the user."))
)]
pub async fn generate_handler(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user_id)): Extension<CurrentUser>,
    Json(body): Json<GenerateRequestBody>,
) -> Result<Json<GenerateResponse>, ApiError> {
    let images = body
        .images
        .into_iter()
        .enumerate()
        .map(|(i, image)| {
            let data = STANDARD
                .decode(image.data_base64.trim())
                .map_err(|e| ApiError::BadRequest(format!("image {} is not valid base64: {}", i, e)))?;
            if !image.mime_type.starts_with("image/") {
                return Err(ApiError::BadRequest(format!("image {} has a non-image MIME type", i)));
            }
            Ok(InlineImage {
                mime_type: image.mime_type,
                data: data.into(),
            })
        })
        .collect::<Result<Vec<_>, ApiError>>()?;

    let outcome = state
        .generation
        .generate(GenerateRequest {
            user_id,
            generation_id: body.generation_id,
            prompt: body.prompt,
            language: body.language,
            plan_id: body.plan_id,
            images,
        })
        .await?;
    Ok(Json(outcome.into()))
}

/// The latest generation shown to the user.
#[utoipa::path(
    get,
    path = "/generations/current",
    responses(
        (status = 200, description = "The current generation", body = GenerationResponse),
        (status = 404, description = "No generation yet", body = ErrorBody)
    ),
    params(("x-user-id" = Uuid, Header, description = "The unique ID of the user."))
)]
pub async fn current_generation_handler(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user_id)): Extension<CurrentUser>,
) -> Result<Json<GenerationResponse>, ApiError> {
    let generation = state
        .generation
        .current_generation(user_id)
        .await?
        .ok_or_else(|| ServiceError::NotFound("no current generation".to_string()))?;
    Ok(Json(generation.into()))
}

#[utoipa::path(
    get,
    path = "/generations/{id}",
    responses(
        (status = 200, description = "The generation row", body = GenerationResponse),
        (status = 404, description = "Unknown generation", body = ErrorBody)
    ),
    params(
        ("id" = Uuid, Path, description = "The generation id."),
        ("x-user-id" = Uuid, Header, description = "The unique ID of the user.")
    )
)]
pub async fn get_generation_handler(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user_id)): Extension<CurrentUser>,
    Path(id): Path<Uuid>,
) -> Result<Json<GenerationResponse>, ApiError> {
    let generation = state.generation.get_generation(user_id, id).await?;
    Ok(Json(generation.into()))
}

//=========================================================================================
// Credits
//=========================================================================================

#[utoipa::path(
    get,
    path = "/credits/balance",
    responses((status = 200, description = "Current credit balance", body = BalanceResponse)),
    params(("x-user-id" = Uuid, Header, description = "The unique ID of the user."))
)]
pub async fn balance_handler(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user_id)): Extension<CurrentUser>,
) -> Result<Json<BalanceResponse>, ApiError> {
    let balance = state.generation.balance(user_id).await?;
    Ok(Json(BalanceResponse { balance }))
}

/// Grant purchased credits once per checkout.
///
/// Called by the payment integration, not by end users. Disabled (404) unless a
/// fulfillment secret is configured.
#[utoipa::path(
    post,
    path = "/credits/fulfill",
    request_body = FulfillRequest,
    responses(
        (status = 200, description = "Credits granted, or the checkout was already fulfilled", body = FulfillResponse),
        (status = 401, description = "Wrong or missing secret", body = ErrorBody),
        (status = 404, description = "Fulfillment is disabled", body = ErrorBody)
    ),
    params(("x-fulfillment-secret" = String, Header, description = "Shared secret of the payment integration."))
)]
pub async fn fulfill_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<FulfillRequest>,
) -> Result<Json<FulfillResponse>, ApiError> {
    let expected = state
        .config
        .fulfillment_secret
        .as_deref()
        .ok_or_else(|| ServiceError::NotFound("fulfillment is disabled".to_string()))?;
    let provided = headers
        .get(FULFILLMENT_SECRET_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !secrets_match(provided, expected) {
        return Err(ApiError::Unauthorized("invalid fulfillment secret".to_string()));
    }

    let outcome = state
        .generation
        .fulfill_purchase(body.user_id, body.credits, &body.checkout_id)
        .await?;
    let balance = state.generation.balance(body.user_id).await?;
    info!(user_id = %body.user_id, ?outcome, "Fulfillment processed");
    Ok(Json(FulfillResponse {
        applied: outcome == LedgerOutcome::Applied,
        balance,
    }))
}

//=========================================================================================
// Helpers
//=========================================================================================

/// Constant-time for equal-length inputs; a length mismatch returns false early.
fn secrets_match(provided: &str, expected: &str) -> bool {
    let (a, b) = (provided.as_bytes(), expected.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Keeps storage keys to a safe character set.
fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned: String = base
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') { c } else { '_' })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "upload.bin".to_string()
    } else {
        cleaned.to_string()
    }
}
