//! Device-local view of the fleet's role definitions

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Context;
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::platform::{PlatformClient, ServiceStream};
use crate::role::{RoleDefinition, ServiceDescription};

/// Service descriptions by id, each tagged with the order it arrived in
#[derive(Debug, Default)]
struct Services {
    by_id: BTreeMap<String, (i64, ServiceDescription)>,
    received: i64,
}

impl Services {
    /// A description from the change feed replaces the service with its id
    fn apply(&mut self, description: ServiceDescription) {
        self.received += 1;
        debug!(
            service = %description.id,
            roles = description.roles.len(),
            "service description received"
        );
        self.by_id
            .insert(description.id.clone(), (self.received, description));
    }

    /// Services fetched in one call; anything the change feed already
    /// delivered is newer and wins
    fn apply_snapshot(&mut self, snapshot: Vec<ServiceDescription>) {
        let older = snapshot.len() as i64;
        for (position, description) in snapshot.into_iter().enumerate() {
            self.by_id
                .entry(description.id.clone())
                .or_insert((position as i64 - older, description));
        }
    }

    /// Roles of every service; on a shared role id the later service wins
    fn roles(&self) -> BTreeMap<String, RoleDefinition> {
        let mut services: Vec<_> = self.by_id.values().collect();
        services.sort_by_key(|(received, _)| *received);

        let mut roles = BTreeMap::new();
        for (_, description) in services {
            for role in &description.roles {
                roles.insert(role.role_id.clone(), role.clone());
            }
        }
        roles
    }
}

type SharedServices = Arc<RwLock<Services>>;

/// Role definitions known to a device, derived from the services it has seen
///
/// Re-sending a service replaces all of its roles. A role id defined by two
/// services resolves to the one received later.
#[derive(Debug, Default)]
pub struct ServiceDirectory {
    services: SharedServices,
    cancel: CancellationToken,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl ServiceDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Follow service changes, then load the current set
    ///
    /// Subscribing first means a description added between the two calls is
    /// seen by at least one of them.
    #[instrument(skip_all)]
    pub async fn register(&self, client: &dyn PlatformClient) -> anyhow::Result<usize> {
        let changes = client
            .service_changes()
            .await
            .context("failed to subscribe to service changes")?;

        let listener = tokio::spawn(listen(
            changes,
            Arc::clone(&self.services),
            self.cancel.clone(),
        ));
        if let Some(previous) = self.listener.lock().replace(listener) {
            previous.abort();
        }

        let services = client
            .all_services()
            .await
            .context("failed to fetch services")?;
        let fetched = services.len();
        self.services.write().apply_snapshot(services);

        let known = self.len();
        info!("registered with {fetched} services, {known} role definitions");
        Ok(known)
    }

    /// Add or replace the service `description` describes
    pub fn apply(&self, description: &ServiceDescription) {
        self.services.write().apply(description.clone());
    }

    pub fn role_definitions(&self) -> Vec<RoleDefinition> {
        self.services.read().roles().into_values().collect()
    }

    pub fn definition(&self, role_id: &str) -> Option<RoleDefinition> {
        self.services.read().roles().remove(role_id)
    }

    pub fn len(&self) -> usize {
        self.services.read().roles().len()
    }

    pub fn is_empty(&self) -> bool {
        self.services
            .read()
            .by_id
            .values()
            .all(|(_, description)| description.roles.is_empty())
    }

    /// Stop following service changes
    pub async fn close(&self) {
        self.cancel.cancel();
        let listener = self.listener.lock().take();
        if let Some(listener) = listener {
            let _ = listener.await;
        }
    }
}

async fn listen(mut changes: ServiceStream, services: SharedServices, cancel: CancellationToken) {
    debug!("listening for service changes");
    loop {
        let change = tokio::select! {
            _ = cancel.cancelled() => break,
            change = changes.next() => change,
        };

        match change {
            Some(Ok(description)) => services.write().apply(description),
            Some(Err(e)) => warn!("service change stream failed: {e}"),
            None => {
                debug!("service change stream ended");
                break;
            }
        }
    }
}
