//! Service descriptions known to the coordination point
//!
//! Descriptions are kept by service id. Each add is fanned out to every
//! open change stream on a broadcast channel; receivers that fall behind
//! skip ahead (they re-sync through [`ServiceStorage::all`] if they care).

use std::collections::BTreeMap;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::role::ServiceDescription;

const CHANGE_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug)]
pub struct ServiceStorage {
    services: RwLock<BTreeMap<String, ServiceDescription>>,
    changes: broadcast::Sender<ServiceDescription>,
}

impl Default for ServiceStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceStorage {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            services: RwLock::new(BTreeMap::new()),
            changes,
        }
    }

    /// Store (or replace) a description and notify change subscribers
    pub fn add(&self, description: ServiceDescription) {
        debug!(
            service = %description.id,
            roles = description.roles.len(),
            "adding service description"
        );
        self.services
            .write()
            .insert(description.id.clone(), description.clone());

        match self.changes.send(description) {
            Ok(receivers) => trace!("service change sent to {receivers} subscribers"),
            Err(_) => trace!("no subscribers for service changes"),
        }
    }

    /// Current descriptions ordered by service id
    pub fn all(&self) -> Vec<ServiceDescription> {
        self.services.read().values().cloned().collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServiceDescription> {
        self.changes.subscribe()
    }

    pub fn len(&self) -> usize {
        self.services.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.read().is_empty()
    }
}
