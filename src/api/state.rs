//! API shared state

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::platform::Platform;

/// Shared state passed to all API handlers
#[derive(Debug, Clone)]
pub struct ApiState {
    pub platform: Arc<Platform>,

    pub started_at: DateTime<Utc>,
}

impl ApiState {
    pub fn new(platform: Arc<Platform>) -> Self {
        Self {
            platform,
            started_at: Utc::now(),
        }
    }
}
