//! HTTP and WebSocket surface, exercised through the remote client

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use bytes::Bytes;
use chrono::Utc;
use colony::api::{ApiConfig, ApiState, spawn_api_server};
use colony::metrics::ThresholdType;
use colony::platform::{Platform, PlatformClient, PlatformError, RemoteClient};
use colony::role::ServiceDescription;
use futures::StreamExt;
use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;

use crate::helpers;

const TOKEN: &str = "test-token";

struct TestServer {
    platform: Arc<Platform>,
    addr: SocketAddr,
    shutdown: CancellationToken,
}

impl TestServer {
    async fn start() -> Self {
        let platform = helpers::platform();
        let shutdown = CancellationToken::new();
        let config = ApiConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            auth_token: Some(TOKEN.to_string()),
            enable_cors: false,
        };
        let addr = spawn_api_server(config, ApiState::new(Arc::clone(&platform)), shutdown.clone())
            .await
            .unwrap();

        Self {
            platform,
            addr,
            shutdown,
        }
    }

    fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    fn client(&self) -> RemoteClient {
        RemoteClient::new(&self.url(), Some(TOKEN.to_string())).unwrap()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[tokio::test]
async fn test_requests_without_token_are_rejected() {
    let server = TestServer::start().await;

    let response = reqwest::get(format!("{}/api/v1/health", server.url()))
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    let wrong = RemoteClient::new(&server.url(), Some("nope".to_string())).unwrap();
    let result = wrong.get("anything").await;
    assert_matches!(result, Err(PlatformError::Status { status: 403, .. }));
}

#[tokio::test]
async fn test_health_and_stats() {
    let server = TestServer::start().await;
    let client = server.client();
    client.store("config", Bytes::from("v1")).await.unwrap();

    let health = client.health().await.unwrap();
    assert_eq!(health.status, "ok");
    assert_eq!(health.version, env!("CARGO_PKG_VERSION"));

    let stats: serde_json::Value = reqwest::Client::new()
        .get(format!("{}/api/v1/stats", server.url()))
        .bearer_auth(TOKEN)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["kv_entries"], 1);
}

#[tokio::test]
async fn test_kv_round_trip() {
    let server = TestServer::start().await;
    let client = server.client();

    client.store("config", Bytes::from("v1")).await.unwrap();
    client.store("config", Bytes::from("v2")).await.unwrap();

    assert_eq!(client.get("config").await.unwrap(), Some(Bytes::from("v2")));
    assert_eq!(client.get("missing").await.unwrap(), None);
    assert_eq!(server.platform.get("config"), Some(Bytes::from("v2")));
}

#[tokio::test]
async fn test_websocket_subscription_receives_published_messages() {
    let server = TestServer::start().await;
    let client = server.client();

    let mut stream = client.subscribe("frames").await.unwrap();
    helpers::wait_until(|| server.platform.queues().number_of_subscribers("frames") == 1).await;

    client.publish("frames", Bytes::from("frame-1")).await.unwrap();
    client.publish("frames", Bytes::from("frame-2")).await.unwrap();

    let first = tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let second = tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(first, Bytes::from("frame-1"));
    assert_eq!(second, Bytes::from("frame-2"));
}

#[tokio::test]
async fn test_get_one_long_polls_until_a_message_arrives() {
    let server = TestServer::start().await;
    let client = server.client();

    let waiter = {
        let client = client.clone();
        tokio::spawn(async move { client.get_one("jobs").await })
    };
    helpers::wait_until(|| server.platform.queues().number_of_subscribers("jobs") == 1).await;

    client.publish("jobs", Bytes::from("job-1")).await.unwrap();

    let message = tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(message, Bytes::from("job-1"));
}

#[tokio::test]
async fn test_get_one_fails_when_platform_shuts_down() {
    let server = TestServer::start().await;
    let client = server.client();

    let waiter = tokio::spawn(async move { client.get_one("jobs").await });
    helpers::wait_until(|| server.platform.queues().number_of_subscribers("jobs") == 1).await;

    server.platform.shutdown();

    let result = tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .unwrap()
        .unwrap();
    assert_matches!(result, Err(PlatformError::Closed));
}

#[tokio::test]
async fn test_metric_queries() {
    let server = TestServer::start().await;
    let client = server.client();
    let since = Utc::now() - chrono::Duration::minutes(1);

    client.store_metric("load", 40.0, None).await.unwrap();
    client.store_metric("load", 60.0, None).await.unwrap();
    client
        .store_metric("load", 500.0, Some(Utc::now() - chrono::Duration::hours(2)))
        .await
        .unwrap();

    assert!(client
        .query_metric("load", 100.0, ThresholdType::GreaterThanOrEqualTo, since)
        .await
        .unwrap());
    assert!(client
        .query_metric("load", 100.0, ThresholdType::LessThan, since)
        .await
        .unwrap());
    assert!(!client
        .query_metric("load", 99.0, ThresholdType::LessThan, since)
        .await
        .unwrap());
}

#[tokio::test]
async fn test_unknown_threshold_type_is_a_bad_request() {
    let server = TestServer::start().await;

    let response = reqwest::Client::new()
        .post(format!("{}/api/v1/metrics/query", server.url()))
        .bearer_auth(TOKEN)
        .json(&serde_json::json!({
            "key": "load",
            "threshold": 1.0,
            "threshold_type": "ROUGHLY",
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 400);
    let body: serde_json::Value = response.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("ROUGHLY"));
}

#[tokio::test]
async fn test_services_are_listed_and_streamed() {
    let server = TestServer::start().await;
    let client = server.client();
    let description = ServiceDescription {
        id: "vision".to_string(),
        roles: vec![helpers::role("detector", "idle", &["CAMERA"], &["fps[10s] >= 100"])],
    };

    let mut changes = client.service_changes().await.unwrap();

    // the server side subscribes after the handshake, so re-add until one arrives
    let streamed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            client.add_service(description.clone()).await.unwrap();
            if let Ok(Some(change)) =
                tokio::time::timeout(Duration::from_millis(100), changes.next()).await
            {
                break change.unwrap();
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(streamed, description);
    assert_eq!(client.all_services().await.unwrap(), vec![description]);
}
