//! In-process client over a shared [`Platform`]

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

use super::client::{ByteStream, PlatformClient, ServiceStream};
use super::error::{PlatformError, PlatformResult};
use super::Platform;
use crate::metrics::ThresholdType;
use crate::role::ServiceDescription;

/// Client that calls straight into a [`Platform`] living in the same process
///
/// `origin` plays the part of the peer address a remote client would have,
/// so several local clients with different origins behave like separate
/// devices to the sticky queue routing.
#[derive(Debug, Clone)]
pub struct LocalClient {
    platform: Arc<Platform>,
    origin: String,
}

impl LocalClient {
    pub fn new(platform: Arc<Platform>, origin: impl Into<String>) -> Self {
        Self {
            platform,
            origin: origin.into(),
        }
    }

    pub fn platform(&self) -> &Arc<Platform> {
        &self.platform
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }
}

#[async_trait]
impl PlatformClient for LocalClient {
    async fn store(&self, key: &str, value: Bytes) -> PlatformResult<()> {
        self.platform.store(key, value);
        Ok(())
    }

    async fn get(&self, key: &str) -> PlatformResult<Option<Bytes>> {
        Ok(self.platform.get(key))
    }

    async fn publish(&self, key: &str, value: Bytes) -> PlatformResult<()> {
        self.platform.publish(key, value);
        Ok(())
    }

    async fn subscribe(&self, key: &str) -> PlatformResult<ByteStream> {
        let rx = self.platform.subscribe(key, &self.origin);
        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|value| (Ok(value), rx))
        });
        Ok(stream.boxed())
    }

    async fn get_one(&self, key: &str) -> PlatformResult<Bytes> {
        self.platform
            .get_one(key, &self.origin)
            .await
            .map_err(|_| PlatformError::Closed)
    }

    async fn store_metric(
        &self,
        key: &str,
        value: f64,
        timestamp: Option<DateTime<Utc>>,
    ) -> PlatformResult<()> {
        self.platform.store_metric(key, value, timestamp);
        Ok(())
    }

    async fn query_metric(
        &self,
        key: &str,
        threshold: f64,
        threshold_type: ThresholdType,
        since: DateTime<Utc>,
    ) -> PlatformResult<bool> {
        Ok(self
            .platform
            .query_metric(key, threshold, threshold_type, since))
    }

    async fn add_service(&self, description: ServiceDescription) -> PlatformResult<()> {
        self.platform.add_service(description);
        Ok(())
    }

    async fn all_services(&self) -> PlatformResult<Vec<ServiceDescription>> {
        Ok(self.platform.all_services())
    }

    async fn service_changes(&self) -> PlatformResult<ServiceStream> {
        let rx = self.platform.service_changes();
        let stream = futures::stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(description) => return Some((Ok(description), rx)),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("service change stream lagged, skipped {skipped} descriptions");
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        });
        Ok(stream.boxed())
    }
}
