//! Queue endpoints
//!
//! The recurring subscription lives in [`crate::api::websocket`].

use axum::{
    extract::{Path, State},
    http::StatusCode,
};
use bytes::Bytes;
use tracing::{debug, trace};

use crate::api::{
    error::{ApiError, ApiResult},
    state::ApiState,
    utils::Origin,
};

/// POST /api/v1/queues/:key
pub async fn publish(
    State(state): State<ApiState>,
    Path(key): Path<String>,
    body: Bytes,
) -> StatusCode {
    trace!(%key, len = body.len(), "publishing");
    state.platform.publish(&key, body);
    StatusCode::NO_CONTENT
}

/// GET /api/v1/queues/:key/next
///
/// Waits until one message is routed to the caller. Dropping the request
/// abandons the single-shot subscription.
pub async fn next(
    State(state): State<ApiState>,
    Path(key): Path<String>,
    Origin(origin): Origin,
) -> ApiResult<Bytes> {
    debug!(%key, %origin, "waiting for one message");
    state
        .platform
        .get_one(&key, &origin)
        .await
        .map_err(|_| ApiError::Unavailable(format!("queue '{key}' closed")))
}
