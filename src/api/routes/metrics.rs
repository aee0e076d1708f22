//! Metric endpoints

use axum::{Json, extract::State, http::StatusCode};
use chrono::Utc;

use crate::api::{
    error::ApiResult,
    state::ApiState,
    types::{QueryMetricRequest, QueryMetricResponse, StoreMetricRequest},
};
use crate::metrics::ThresholdType;

/// POST /api/v1/metrics
pub async fn store_metric(
    State(state): State<ApiState>,
    Json(request): Json<StoreMetricRequest>,
) -> StatusCode {
    state
        .platform
        .store_metric(&request.key, request.value, request.timestamp);
    StatusCode::NO_CONTENT
}

/// POST /api/v1/metrics/query
///
/// Unknown threshold types are rejected with 400.
pub async fn query_metric(
    State(state): State<ApiState>,
    Json(request): Json<QueryMetricRequest>,
) -> ApiResult<Json<QueryMetricResponse>> {
    let threshold_type: ThresholdType = request.threshold_type.parse()?;
    let since = request.since.unwrap_or_else(Utc::now);

    let met = state
        .platform
        .query_metric(&request.key, request.threshold, threshold_type, since);

    Ok(Json(QueryMetricResponse { met }))
}
