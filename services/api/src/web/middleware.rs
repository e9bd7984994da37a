//! services/api/src/web/middleware.rs
//!
//! Authentication middleware for protecting routes.

use axum::{extract::Request, middleware::Next, response::Response};
use uuid::Uuid;

use crate::error::ApiError;
use crate::web::state::CurrentUser;

pub const USER_ID_HEADER: &str = "x-user-id";

/// Reads the user id the auth gateway put in `x-user-id` and stores it as a
/// `CurrentUser` extension. Missing or malformed ids are rejected with 401.
pub async fn require_auth(mut req: Request, next: Next) -> Result<Response, ApiError> {
    let raw = req
        .headers()
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::Unauthorized(format!("{} header is required", USER_ID_HEADER)))?;

    let user_id = Uuid::parse_str(raw.trim())
        .map_err(|_| ApiError::Unauthorized(format!("invalid {} format", USER_ID_HEADER)))?;

    req.extensions_mut().insert(CurrentUser(user_id));
    Ok(next.run(req).await)
}
