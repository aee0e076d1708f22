//! Key/value endpoints

use axum::{
    extract::{Path, State},
    http::StatusCode,
};
use bytes::Bytes;
use tracing::trace;

use crate::api::{
    error::{ApiError, ApiResult},
    state::ApiState,
};

/// PUT /api/v1/kv/:key
pub async fn put_value(
    State(state): State<ApiState>,
    Path(key): Path<String>,
    body: Bytes,
) -> StatusCode {
    trace!(%key, len = body.len(), "storing value");
    state.platform.store(&key, body);
    StatusCode::NO_CONTENT
}

/// GET /api/v1/kv/:key
pub async fn get_value(
    State(state): State<ApiState>,
    Path(key): Path<String>,
) -> ApiResult<Bytes> {
    state
        .platform
        .get(&key)
        .ok_or_else(|| ApiError::NotFound(format!("no value stored under '{key}'")))
}
