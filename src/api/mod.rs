//! HTTP and WebSocket server of the coordination point
//!
//! ## Endpoints
//!
//! - `GET /api/v1/health` - Health check
//! - `GET /api/v1/stats` - Store counters
//! - `PUT|GET /api/v1/kv/:key` - Plain key/value access
//! - `POST /api/v1/queues/:key` - Publish a message
//! - `WS /api/v1/queues/:key/subscribe` - Recurring subscription (binary frames)
//! - `GET /api/v1/queues/:key/next` - Single-shot subscription (long poll)
//! - `POST /api/v1/metrics` - Record a sample
//! - `POST /api/v1/metrics/query` - Evaluate a threshold
//! - `POST|GET /api/v1/services` - Add or list service descriptions
//! - `WS /api/v1/services/stream` - Service descriptions as they are added (JSON text frames)
//!
//! Queue subscriptions are attributed to the peer IP of the connection,
//! which is the key sticky routing uses.

#[cfg(feature = "api")]
pub mod error;
#[cfg(feature = "api")]
pub mod middleware;
#[cfg(feature = "api")]
pub mod routes;
#[cfg(feature = "api")]
pub mod state;
pub mod types;
#[cfg(feature = "api")]
pub mod utils;
#[cfg(feature = "api")]
pub mod websocket;

#[cfg(feature = "api")]
pub use error::{ApiError, ApiResult};
#[cfg(feature = "api")]
pub use state::ApiState;
pub use types::{
    HealthResponse, QueryMetricRequest, QueryMetricResponse, StatsResponse, StoreMetricRequest,
};

#[cfg(feature = "api")]
use axum::{
    Router,
    routing::{get, post},
};
use std::net::SocketAddr;
#[cfg(feature = "api")]
use tokio_util::sync::CancellationToken;
#[cfg(feature = "api")]
use tracing::info;

/// API server configuration
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Bind address (e.g., "0.0.0.0:5555")
    pub bind_addr: SocketAddr,

    /// Optional authentication token
    pub auth_token: Option<String>,

    pub enable_cors: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], crate::util::DEFAULT_PLATFORM_PORT)),
            auth_token: None,
            enable_cors: false,
        }
    }
}

/// Router with every endpoint, without auth or CORS layers
#[cfg(feature = "api")]
pub fn router(state: ApiState) -> Router {
    use tower_http::trace::TraceLayer;

    Router::new()
        .route("/api/v1/health", get(routes::health::health_check))
        .route("/api/v1/stats", get(routes::stats::get_stats))
        .route(
            "/api/v1/kv/:key",
            get(routes::kv::get_value).put(routes::kv::put_value),
        )
        .route("/api/v1/queues/:key", post(routes::queues::publish))
        .route(
            "/api/v1/queues/:key/subscribe",
            get(websocket::queue_subscribe_handler),
        )
        .route("/api/v1/queues/:key/next", get(routes::queues::next))
        .route("/api/v1/metrics", post(routes::metrics::store_metric))
        .route("/api/v1/metrics/query", post(routes::metrics::query_metric))
        .route(
            "/api/v1/services",
            get(routes::services::list_services).post(routes::services::add_service),
        )
        .route(
            "/api/v1/services/stream",
            get(websocket::service_stream_handler),
        )
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Spawn the API server
///
/// Serves until `shutdown` is cancelled. Returns the bound address.
#[cfg(feature = "api")]
pub async fn spawn_api_server(
    config: ApiConfig,
    state: ApiState,
    shutdown: CancellationToken,
) -> anyhow::Result<SocketAddr> {
    use anyhow::Context;
    use tower_http::cors::{Any, CorsLayer};

    info!("starting API server on {}", config.bind_addr);

    let mut app = router(state);

    if config.enable_cors {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
        app = app.layer(cors);
    }

    if let Some(token) = config.auth_token {
        app = app.layer(axum::middleware::from_fn_with_state(
            token,
            middleware::auth::require_token,
        ));
    }

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    let addr = listener.local_addr()?;

    info!("API server listening on {}", addr);

    tokio::spawn(async move {
        let server = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { shutdown.cancelled().await });

        if let Err(e) = server.await {
            tracing::error!("API server error: {}", e);
        }
    });

    Ok(addr)
}
