//! services/api/src/web/router.rs
//!
//! Assembles the complete HTTP application from the handlers.

use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    http::{
        header::{ACCEPT, CONTENT_TYPE},
        HeaderName, Method,
    },
    middleware as axum_middleware,
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::web::middleware::{require_auth, USER_ID_HEADER};
use crate::web::rest::{self, ApiDoc, FULFILLMENT_SECRET_HEADER};
use crate::web::state::AppState;

/// Requests carry inline base64 images and multipart uploads.
const MAX_BODY_BYTES: usize = 25 * 1024 * 1024;

pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            CONTENT_TYPE,
            ACCEPT,
            HeaderName::from_static(USER_ID_HEADER),
            HeaderName::from_static(FULFILLMENT_SECRET_HEADER),
        ]);

    // Public routes (no x-user-id required)
    let public_routes = Router::new()
        .route("/health", get(rest::health_handler))
        .route("/credits/fulfill", post(rest::fulfill_handler));

    // Protected routes (x-user-id required)
    let protected_routes = Router::new()
        .route("/plans/{plan_id}/materials", post(rest::register_material_handler))
        .route("/plans/{plan_id}/materials/upload", post(rest::upload_material_handler))
        .route("/plans/{plan_id}/materials/status", get(rest::materials_status_handler))
        .route("/plans/{plan_id}/kick", post(rest::kick_handler))
        .route("/generations", post(rest::generate_handler))
        .route("/generations/current", get(rest::current_generation_handler))
        .route("/generations/{id}", get(rest::get_generation_handler))
        .route("/credits/balance", get(rest::balance_handler))
        .layer(axum_middleware::from_fn(require_auth));

    let api_router = Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(cors)
        .with_state(state);

    Router::new()
        .merge(api_router)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
}
