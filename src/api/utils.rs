//! Extractors shared by the handlers

use std::convert::Infallible;
use std::net::SocketAddr;

use async_trait::async_trait;
use axum::extract::{ConnectInfo, FromRequestParts};
use axum::http::request::Parts;

/// Peer IP of the connection, port stripped
///
/// Falls back to `"unknown"` when the server runs without connect info,
/// e.g. a bare router driven by tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin(pub String);

#[async_trait]
impl<S> FromRequestParts<S> for Origin
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let origin = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string())
            .unwrap_or_else(|| "unknown".to_string());
        Ok(Origin(origin))
    }
}
