//! Docker Engine API client
//!
//! Speaks the engine's HTTP API over TCP (`DOCKER_HOST=tcp://...` style
//! endpoints). Only the handful of calls the container runner needs are
//! implemented.

use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use reqwest::{Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, instrument, trace};

use super::container::{
    ContainerEvent, ContainerRuntime, ContainerSpec, DiskUsage, RuntimeError, RuntimeResult,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Pulls can take minutes on slow edge links
const PULL_TIMEOUT: Duration = Duration::from_secs(600);

/// Container runtime backed by a Docker daemon
#[derive(Debug, Clone)]
pub struct DockerEngine {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Deserialize)]
struct CreateResponse {
    #[serde(rename = "Id")]
    id: String,
}

#[derive(Deserialize)]
struct EngineMessage {
    message: String,
}

#[derive(Deserialize)]
struct RawEvent {
    #[serde(rename = "Type", default)]
    kind: String,
    #[serde(rename = "Action", default)]
    action: String,
    #[serde(rename = "Actor")]
    actor: Option<RawActor>,
}

#[derive(Deserialize)]
struct RawActor {
    #[serde(rename = "ID", default)]
    id: String,
}

#[derive(Deserialize)]
struct SystemDf {
    #[serde(rename = "Images", default)]
    images: Option<Vec<ImageUsage>>,
    #[serde(rename = "Containers", default)]
    containers: Option<Vec<ContainerUsage>>,
}

#[derive(Deserialize)]
struct ImageUsage {
    #[serde(rename = "Size", default)]
    size: i64,
}

#[derive(Deserialize)]
struct ContainerUsage {
    #[serde(rename = "SizeRootFs", default)]
    size_root_fs: i64,
}

#[derive(Deserialize)]
struct PruneResponse {
    #[serde(rename = "SpaceReclaimed", default)]
    space_reclaimed: u64,
}

impl DockerEngine {
    /// Client for the daemon at `host`, e.g. `tcp://127.0.0.1:2375` or
    /// `http://127.0.0.1:2375`
    pub fn new(host: &str) -> RuntimeResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| RuntimeError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            base_url: normalize_host(host),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> RuntimeResult<Response> {
        request.send().await.map_err(transport)
    }
}

fn normalize_host(host: &str) -> String {
    let host = host.trim_end_matches('/');
    match host.strip_prefix("tcp://") {
        Some(rest) => format!("http://{rest}"),
        None => host.to_string(),
    }
}

fn transport(err: reqwest::Error) -> RuntimeError {
    RuntimeError::Transport(err.to_string())
}

/// Extract the engine's `{"message": ...}` body, falling back to the raw text
async fn error_message(response: Response) -> String {
    let status = response.status();
    match response.text().await {
        Ok(body) => serde_json::from_str::<EngineMessage>(&body)
            .map(|m| m.message)
            .unwrap_or_else(|_| if body.is_empty() { status.to_string() } else { body }),
        Err(_) => status.to_string(),
    }
}

async fn classify(response: Response) -> RuntimeError {
    let status = response.status();
    let message = error_message(response).await;
    match status {
        StatusCode::NOT_MODIFIED => RuntimeError::NotModified,
        StatusCode::NOT_FOUND => RuntimeError::NotFound(message),
        s if s.is_client_error() => RuntimeError::Client(message),
        _ => RuntimeError::Server(message),
    }
}

/// Split `image[:tag]` into the pull query parameters
fn image_reference(image: &str) -> (&str, &str) {
    // a colon before the last slash belongs to a registry port
    let name_start = image.rfind('/').map_or(0, |i| i + 1);
    match image[name_start..].rfind(':') {
        Some(i) => (&image[..name_start + i], &image[name_start + i + 1..]),
        None => (image, "latest"),
    }
}

fn parse_event(line: &[u8]) -> Option<RuntimeResult<ContainerEvent>> {
    let raw: RawEvent = match serde_json::from_slice(line) {
        Ok(raw) => raw,
        Err(e) => return Some(Err(RuntimeError::Decode(e.to_string()))),
    };
    if raw.kind != "container" {
        return None;
    }

    let container_id = raw.actor.map(|a| a.id).unwrap_or_default();
    let event = match raw.action.as_str() {
        "die" => ContainerEvent::Died { container_id },
        "destroy" => ContainerEvent::Destroyed { container_id },
        _ => ContainerEvent::Other {
            action: raw.action,
            container_id,
        },
    };
    Some(Ok(event))
}

/// Turn a chunked body into one item per newline-terminated JSON document
fn ndjson_events(
    body: impl Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
) -> BoxStream<'static, RuntimeResult<ContainerEvent>> {
    let state = (Box::pin(body), BytesMut::new());

    futures::stream::unfold(state, |(mut body, mut buffer)| async move {
        loop {
            if let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let line = buffer.split_to(pos + 1);
                let line = line.trim_ascii();
                if line.is_empty() {
                    continue;
                }
                match parse_event(line) {
                    Some(event) => return Some((event, (body, buffer))),
                    None => continue,
                }
            }

            match body.next().await {
                Some(Ok(chunk)) => buffer.extend_from_slice(&chunk),
                Some(Err(e)) => return Some((Err(transport(e)), (body, buffer))),
                None => return None,
            }
        }
    })
    .boxed()
}

#[async_trait]
impl ContainerRuntime for DockerEngine {
    #[instrument(skip(self, spec), fields(image = %spec.image))]
    async fn create_container(&self, spec: &ContainerSpec) -> RuntimeResult<String> {
        let body = json!({
            "Image": spec.image,
            "Env": spec.env,
            "HostConfig": { "NetworkMode": spec.network_mode },
        });

        let response = self
            .send(
                self.client
                    .post(self.url("/containers/create"))
                    .timeout(REQUEST_TIMEOUT)
                    .json(&body),
            )
            .await?;

        match response.status() {
            StatusCode::CREATED => {
                let created: CreateResponse = response
                    .json()
                    .await
                    .map_err(|e| RuntimeError::Decode(e.to_string()))?;
                debug!(container_id = %created.id, "container created");
                Ok(created.id)
            }
            StatusCode::NOT_FOUND => Err(RuntimeError::ImageNotFound(spec.image.clone())),
            _ => Err(classify(response).await),
        }
    }

    async fn start_container(&self, id: &str) -> RuntimeResult<()> {
        let response = self
            .send(
                self.client
                    .post(self.url(&format!("/containers/{id}/start")))
                    .timeout(REQUEST_TIMEOUT),
            )
            .await?;

        match response.status() {
            StatusCode::NO_CONTENT => Ok(()),
            _ => Err(classify(response).await),
        }
    }

    async fn stop_container(&self, id: &str) -> RuntimeResult<()> {
        let response = self
            .send(
                self.client
                    .post(self.url(&format!("/containers/{id}/stop")))
                    .timeout(REQUEST_TIMEOUT),
            )
            .await?;

        match response.status() {
            StatusCode::NO_CONTENT => Ok(()),
            _ => Err(classify(response).await),
        }
    }

    async fn remove_container(&self, id: &str) -> RuntimeResult<()> {
        let response = self
            .send(
                self.client
                    .delete(self.url(&format!("/containers/{id}")))
                    .query(&[("force", "true")])
                    .timeout(REQUEST_TIMEOUT),
            )
            .await?;

        match response.status() {
            StatusCode::NO_CONTENT => Ok(()),
            _ => Err(classify(response).await),
        }
    }

    #[instrument(skip(self))]
    async fn pull_image(&self, image: &str) -> RuntimeResult<()> {
        let (name, tag) = image_reference(image);
        let response = self
            .send(
                self.client
                    .post(self.url("/images/create"))
                    .query(&[("fromImage", name), ("tag", tag)])
                    .timeout(PULL_TIMEOUT),
            )
            .await?;

        if !response.status().is_success() {
            return Err(classify(response).await);
        }

        // the engine reports pull failures inside a 200 progress stream
        let body = response.text().await.map_err(transport)?;
        for line in body.lines().filter(|l| !l.trim().is_empty()) {
            let progress: serde_json::Value =
                serde_json::from_str(line).map_err(|e| RuntimeError::Decode(e.to_string()))?;
            if let Some(error) = progress.get("error").and_then(|e| e.as_str()) {
                return Err(RuntimeError::Client(error.to_string()));
            }
            trace!(%progress, "pull progress");
        }

        debug!("image pulled");
        Ok(())
    }

    async fn events(&self) -> RuntimeResult<BoxStream<'static, RuntimeResult<ContainerEvent>>> {
        let filters = json!({ "type": ["container"] }).to_string();
        let response = self
            .send(
                self.client
                    .get(self.url("/events"))
                    .query(&[("filters", filters)]),
            )
            .await?;

        if !response.status().is_success() {
            return Err(classify(response).await);
        }

        Ok(ndjson_events(response.bytes_stream()))
    }

    async fn disk_usage(&self) -> RuntimeResult<DiskUsage> {
        let response = self
            .send(
                self.client
                    .get(self.url("/system/df"))
                    .timeout(REQUEST_TIMEOUT),
            )
            .await?;

        if !response.status().is_success() {
            return Err(classify(response).await);
        }

        let df: SystemDf = response
            .json()
            .await
            .map_err(|e| RuntimeError::Decode(e.to_string()))?;

        let images = df
            .images
            .unwrap_or_default()
            .iter()
            .map(|i| i.size.max(0) as u64)
            .sum();
        let containers = df
            .containers
            .unwrap_or_default()
            .iter()
            .map(|c| c.size_root_fs.max(0) as u64)
            .sum();

        Ok(DiskUsage { images, containers })
    }

    #[instrument(skip(self))]
    async fn prune(&self, until: &str) -> RuntimeResult<u64> {
        let container_filters = json!({ "until": [until] }).to_string();
        let image_filters = json!({ "until": [until], "dangling": ["false"] }).to_string();

        let mut reclaimed = 0;
        for (path, filters) in [
            ("/containers/prune", container_filters),
            ("/images/prune", image_filters),
        ] {
            let response = self
                .send(
                    self.client
                        .post(self.url(path))
                        .query(&[("filters", filters)])
                        .timeout(REQUEST_TIMEOUT),
                )
                .await?;

            if !response.status().is_success() {
                return Err(classify(response).await);
            }

            let pruned: PruneResponse = response
                .json()
                .await
                .map_err(|e| RuntimeError::Decode(e.to_string()))?;
            reclaimed += pruned.space_reclaimed;
        }

        Ok(reclaimed)
    }
}
