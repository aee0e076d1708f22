//! Request and response bodies
//!
//! Shared by the server and `RemoteClient`, so nothing here depends on the
//! server stack.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::platform::PlatformStats;

/// Body of `GET /api/v1/health`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    /// Crate version of the serving platform
    pub version: String,
    pub uptime_secs: i64,
}

/// Body of `POST /api/v1/metrics`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreMetricRequest {
    pub key: String,
    pub value: f64,
    /// Defaults to the time the platform receives the sample
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Body of `POST /api/v1/metrics/query`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryMetricRequest {
    pub key: String,
    pub threshold: f64,
    /// `GREATER_THAN_OR_EQUAL_TO`, `LESS_THAN` or the operator symbol
    pub threshold_type: String,
    /// Window start, defaults to now
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryMetricResponse {
    pub met: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsResponse {
    pub timestamp: String,
    pub uptime_secs: i64,
    #[serde(flatten)]
    pub platform: PlatformStats,
}
