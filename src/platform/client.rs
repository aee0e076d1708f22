//! What devices and roles need from the coordination point

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use futures::stream::BoxStream;

use super::error::PlatformResult;
use crate::metrics::ThresholdType;
use crate::role::{Metric, ServiceDescription};

/// Stream of queue messages
pub type ByteStream = BoxStream<'static, PlatformResult<Bytes>>;

/// Stream of service descriptions
pub type ServiceStream = BoxStream<'static, PlatformResult<ServiceDescription>>;

/// Window over which a role's execution counter counts as active workload
pub const WORKLOAD_WINDOW_SECS: i64 = 5;

/// Name of the execution counter recorded for `role_id` on `hostname`
pub fn workload_key(hostname: &str, role_id: &str) -> String {
    format!("num_executions_{hostname}_{role_id}")
}

/// Connection to the coordination point
///
/// Every streaming call is attributed, on the platform side, to the caller's
/// origin address; that address is what sticky queue routing keys on.
#[async_trait]
pub trait PlatformClient: Send + Sync {
    /// Overwrite the kv entry for `key`
    async fn store(&self, key: &str, value: Bytes) -> PlatformResult<()>;

    async fn get(&self, key: &str) -> PlatformResult<Option<Bytes>>;

    async fn publish(&self, key: &str, value: Bytes) -> PlatformResult<()>;

    /// Receive messages routed to this caller on `key` until the stream is dropped
    async fn subscribe(&self, key: &str) -> PlatformResult<ByteStream>;

    /// Wait for exactly one message on `key`
    async fn get_one(&self, key: &str) -> PlatformResult<Bytes>;

    async fn store_metric(
        &self,
        key: &str,
        value: f64,
        timestamp: Option<DateTime<Utc>>,
    ) -> PlatformResult<()>;

    async fn query_metric(
        &self,
        key: &str,
        threshold: f64,
        threshold_type: ThresholdType,
        since: DateTime<Utc>,
    ) -> PlatformResult<bool>;

    async fn add_service(&self, description: ServiceDescription) -> PlatformResult<()>;

    async fn all_services(&self) -> PlatformResult<Vec<ServiceDescription>>;

    /// Every description added from now on
    async fn service_changes(&self) -> PlatformResult<ServiceStream>;

    /// Release the connection
    async fn close(&self) {}

    /// Evaluate a gate over its trailing window ending now
    async fn metric_met(&self, metric: &Metric) -> PlatformResult<bool> {
        self.query_metric(
            &metric.key,
            metric.threshold,
            metric.threshold_type,
            metric.since(Utc::now()),
        )
        .await
    }

    /// Whether `role_id` handled any work on `hostname` in the last few seconds
    async fn has_workload(&self, hostname: &str, role_id: &str) -> PlatformResult<bool> {
        self.query_metric(
            &workload_key(hostname, role_id),
            1.0,
            ThresholdType::GreaterThanOrEqualTo,
            Utc::now() - Duration::seconds(WORKLOAD_WINDOW_SECS),
        )
        .await
    }
}
