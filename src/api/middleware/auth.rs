//! Shared-token check in front of every route
//!
//! Applies to WebSocket upgrades too; the remote client sends the header on
//! the handshake.

use axum::{
    body::Body,
    extract::{Request, State},
    http::{HeaderMap, header},
    middleware::Next,
    response::Response,
};

use crate::api::{ApiError, ApiResult};

/// Token carried by `Authorization: Bearer <token>`
fn bearer_token(headers: &HeaderMap) -> ApiResult<&str> {
    let value = headers
        .get(header::AUTHORIZATION)
        .ok_or_else(|| ApiError::Unauthorized("missing Authorization header".to_string()))?;

    value
        .to_str()
        .ok()
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or_else(|| ApiError::Unauthorized("expected 'Bearer <token>'".to_string()))
}

pub async fn require_token(
    State(token): State<String>,
    request: Request<Body>,
    next: Next,
) -> ApiResult<Response> {
    if bearer_token(request.headers())? != token {
        tracing::debug!(uri = %request.uri(), "rejected request with wrong token");
        return Err(ApiError::Forbidden("invalid token".to_string()));
    }

    Ok(next.run(request).await)
}
