//! Client for a coordination point served over HTTP
//!
//! Unary calls use `reqwest`; subscriptions and the service change feed are
//! WebSockets opened with `tokio-tungstenite`. Queue keys are placed in the
//! URL path as-is, so they must not contain `/`, `?` or `#`.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, header};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, instrument};

use super::client::{ByteStream, PlatformClient, ServiceStream};
use super::error::{PlatformError, PlatformResult};
use crate::api::types::{
    HealthResponse, QueryMetricRequest, QueryMetricResponse, StoreMetricRequest,
};
use crate::metrics::ThresholdType;
use crate::role::ServiceDescription;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone)]
pub struct RemoteClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl RemoteClient {
    /// Client for the platform at `base_url`, e.g. `http://10.0.0.1:5555`
    pub fn new(base_url: &str, token: Option<String>) -> PlatformResult<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn health(&self) -> PlatformResult<HealthResponse> {
        let response = self
            .request(Method::GET, "/api/v1/health")
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        Ok(check(response).await?.json().await?)
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let request = self.http.request(method, format!("{}{path}", self.base_url));
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn ws_url(&self, path: &str) -> String {
        let base = if let Some(rest) = self.base_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.base_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            self.base_url.clone()
        };
        format!("{base}{path}")
    }

    async fn connect(&self, path: &str) -> PlatformResult<Socket> {
        let mut request = self.ws_url(path).into_client_request()?;
        if let Some(token) = &self.token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| PlatformError::Transport(e.to_string()))?;
            request.headers_mut().insert(header::AUTHORIZATION, value);
        }

        let (socket, response) = tokio_tungstenite::connect_async(request).await?;
        debug!(status = %response.status(), "websocket connected to {path}");
        Ok(socket)
    }
}

/// Turn a non-success response into [`PlatformError::Status`]
async fn check(response: Response) -> PlatformResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let message = response
        .json::<serde_json::Value>()
        .await
        .ok()
        .and_then(|body| body.get("error")?.as_str().map(str::to_string))
        .unwrap_or_else(|| status.to_string());

    Err(PlatformError::Status {
        status: status.as_u16(),
        message,
    })
}

#[async_trait]
impl PlatformClient for RemoteClient {
    async fn store(&self, key: &str, value: Bytes) -> PlatformResult<()> {
        let response = self
            .request(Method::PUT, &format!("/api/v1/kv/{key}"))
            .timeout(REQUEST_TIMEOUT)
            .body(value)
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> PlatformResult<Option<Bytes>> {
        let response = self
            .request(Method::GET, &format!("/api/v1/kv/{key}"))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(check(response).await?.bytes().await?))
    }

    async fn publish(&self, key: &str, value: Bytes) -> PlatformResult<()> {
        let response = self
            .request(Method::POST, &format!("/api/v1/queues/{key}"))
            .timeout(REQUEST_TIMEOUT)
            .body(value)
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn subscribe(&self, key: &str) -> PlatformResult<ByteStream> {
        let socket = self
            .connect(&format!("/api/v1/queues/{key}/subscribe"))
            .await?;

        let stream = socket.filter_map(|frame| async move {
            match frame {
                Ok(Message::Binary(data)) => Some(Ok(Bytes::from(data))),
                Ok(_) => None,
                Err(e) => Some(Err(PlatformError::from(e))),
            }
        });
        Ok(stream.boxed())
    }

    /// Long-polls without a timeout
    async fn get_one(&self, key: &str) -> PlatformResult<Bytes> {
        let response = self
            .request(Method::GET, &format!("/api/v1/queues/{key}/next"))
            .send()
            .await?;

        if response.status() == StatusCode::SERVICE_UNAVAILABLE {
            return Err(PlatformError::Closed);
        }
        Ok(check(response).await?.bytes().await?)
    }

    async fn store_metric(
        &self,
        key: &str,
        value: f64,
        timestamp: Option<DateTime<Utc>>,
    ) -> PlatformResult<()> {
        let body = StoreMetricRequest {
            key: key.to_string(),
            value,
            timestamp,
        };
        let response = self
            .request(Method::POST, "/api/v1/metrics")
            .timeout(REQUEST_TIMEOUT)
            .json(&body)
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    async fn query_metric(
        &self,
        key: &str,
        threshold: f64,
        threshold_type: ThresholdType,
        since: DateTime<Utc>,
    ) -> PlatformResult<bool> {
        let body = QueryMetricRequest {
            key: key.to_string(),
            threshold,
            threshold_type: threshold_type.to_string(),
            since: Some(since),
        };
        let response = self
            .request(Method::POST, "/api/v1/metrics/query")
            .timeout(REQUEST_TIMEOUT)
            .json(&body)
            .send()
            .await?;

        let answer: QueryMetricResponse = check(response).await?.json().await?;
        Ok(answer.met)
    }

    async fn add_service(&self, description: ServiceDescription) -> PlatformResult<()> {
        let response = self
            .request(Method::POST, "/api/v1/services")
            .timeout(REQUEST_TIMEOUT)
            .json(&description)
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    async fn all_services(&self) -> PlatformResult<Vec<ServiceDescription>> {
        let response = self
            .request(Method::GET, "/api/v1/services")
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        Ok(check(response).await?.json().await?)
    }

    #[instrument(skip(self))]
    async fn service_changes(&self) -> PlatformResult<ServiceStream> {
        let socket = self.connect("/api/v1/services/stream").await?;

        let stream = socket.filter_map(|frame| async move {
            match frame {
                Ok(Message::Text(text)) => Some(
                    serde_json::from_str::<ServiceDescription>(&text).map_err(PlatformError::from),
                ),
                Ok(_) => None,
                Err(e) => Some(Err(PlatformError::from(e))),
            }
        });
        Ok(stream.boxed())
    }

    async fn close(&self) {
        debug!(platform = %self.base_url, "closing platform client");
    }
}
