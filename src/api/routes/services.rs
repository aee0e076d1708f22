//! Service description endpoints

use axum::{Json, extract::State, http::StatusCode};
use tracing::info;

use crate::api::state::ApiState;
use crate::role::ServiceDescription;

/// POST /api/v1/services
///
/// A description with an existing id replaces the stored one.
pub async fn add_service(
    State(state): State<ApiState>,
    Json(description): Json<ServiceDescription>,
) -> StatusCode {
    info!(
        service = %description.id,
        roles = description.roles.len(),
        "service description added"
    );
    state.platform.add_service(description);
    StatusCode::NO_CONTENT
}

/// GET /api/v1/services
pub async fn list_services(State(state): State<ApiState>) -> Json<Vec<ServiceDescription>> {
    Json(state.platform.all_services())
}
