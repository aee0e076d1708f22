//! The coordination point and the client seam devices use to reach it
//!
//! [`Platform`] owns all shared state (kv, queues, metrics, service
//! descriptions). Devices and roles never touch it directly; they go through
//! a [`PlatformClient`], either [`LocalClient`] in the same process or
//! `RemoteClient` over HTTP and WebSockets.

pub mod client;
pub mod error;
pub mod local;
#[cfg(feature = "remote")]
pub mod remote;

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info};

use crate::metrics::{MetricsStore, ThresholdMonitor, ThresholdType};
use crate::role::ServiceDescription;
use crate::storage::{KeyValueStore, QueueStore, ServiceStorage};

pub use client::{ByteStream, PlatformClient, ServiceStream};
pub use error::{PlatformError, PlatformResult};
pub use local::LocalClient;
#[cfg(feature = "remote")]
pub use remote::RemoteClient;

/// Counters exposed on the stats endpoint
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PlatformStats {
    pub kv_entries: usize,
    pub queue_keys: usize,
    pub queued_messages: usize,
    pub metric_keys: usize,
    pub metric_samples: usize,
    pub services: usize,
}

/// Shared state of the coordination point
#[derive(Debug)]
pub struct Platform {
    kv: KeyValueStore,
    queues: QueueStore,
    metrics: Arc<MetricsStore>,
    monitor: ThresholdMonitor,
    services: ServiceStorage,
}

impl Default for Platform {
    fn default() -> Self {
        Self::new()
    }
}

impl Platform {
    pub fn new() -> Self {
        let metrics = Arc::new(MetricsStore::new());
        Self {
            kv: KeyValueStore::new(),
            queues: QueueStore::new(Arc::clone(&metrics)),
            monitor: ThresholdMonitor::new(Arc::clone(&metrics)),
            metrics,
            services: ServiceStorage::new(),
        }
    }

    pub fn store(&self, key: &str, value: Bytes) {
        self.kv.store(key, value);
    }

    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.kv.get(key)
    }

    pub fn publish(&self, key: &str, value: Bytes) {
        self.queues.publish(key, value);
    }

    /// Open a recurring subscription on `key` for the caller at `origin`
    pub fn subscribe(&self, key: &str, origin: &str) -> mpsc::UnboundedReceiver<Bytes> {
        self.queues.subscribe(key, origin)
    }

    /// Take a single message from `key` for the caller at `origin`
    pub fn get_one(&self, key: &str, origin: &str) -> oneshot::Receiver<Bytes> {
        self.queues.get_one(key, origin)
    }

    /// Record a sample, stamped now unless a timestamp is given
    pub fn store_metric(&self, key: &str, value: f64, timestamp: Option<DateTime<Utc>>) {
        self.metrics
            .store(key, value, timestamp.unwrap_or_else(Utc::now));
    }

    pub fn query_metric(
        &self,
        key: &str,
        threshold: f64,
        threshold_type: ThresholdType,
        since: DateTime<Utc>,
    ) -> bool {
        self.monitor
            .metric_is_met(key, threshold, threshold_type, since)
    }

    pub fn add_service(&self, description: ServiceDescription) {
        self.services.add(description);
    }

    pub fn all_services(&self) -> Vec<ServiceDescription> {
        self.services.all()
    }

    pub fn service_changes(&self) -> broadcast::Receiver<ServiceDescription> {
        self.services.subscribe()
    }

    pub fn metrics(&self) -> &Arc<MetricsStore> {
        &self.metrics
    }

    pub fn queues(&self) -> &QueueStore {
        &self.queues
    }

    /// Drop metric samples older than `cutoff`
    pub fn prune_metrics(&self, cutoff: DateTime<Utc>) -> usize {
        let removed = self.metrics.prune_before(cutoff);
        debug!("metrics retention removed {removed} samples");
        removed
    }

    pub fn stats(&self) -> PlatformStats {
        PlatformStats {
            kv_entries: self.kv.len(),
            queue_keys: self.queues.keys().len(),
            queued_messages: self.queues.total_backlog(),
            metric_keys: self.metrics.len(),
            metric_samples: self.metrics.sample_count(),
            services: self.services.len(),
        }
    }

    /// End every open queue subscription
    pub fn shutdown(&self) {
        info!("completing all subscriber streams");
        self.queues.complete_all();
    }
}
