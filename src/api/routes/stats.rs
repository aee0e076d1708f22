//! Store statistics endpoint

use axum::{Json, extract::State};
use chrono::Utc;

use crate::api::{state::ApiState, types::StatsResponse};

/// GET /api/v1/stats
pub async fn get_stats(State(state): State<ApiState>) -> Json<StatsResponse> {
    let now = Utc::now();

    Json(StatsResponse {
        timestamp: now.to_rfc3339(),
        uptime_secs: (now - state.started_at).num_seconds(),
        platform: state.platform.stats(),
    })
}
