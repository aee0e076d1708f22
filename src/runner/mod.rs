//! Executing role instances on a device
//!
//! Two backends implement [`RoleBackend`]: [`ContainerRoleRunner`] launches
//! container images through a [`ContainerRuntime`], [`InProcessRoleRunner`]
//! runs [`RoleProgram`](crate::role::RoleProgram)s on a bounded task pool.
//! [`RoleRunner`] composes both and dispatches on the payload kind.
//!
//! Both backends serialize start and stop for the same role id and publish a
//! [`RoleStopped`] event whenever a role leaves their running set.

pub mod container;
pub mod docker;
pub mod in_process;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{OwnedMutexGuard, broadcast};
use tracing::debug;

use crate::config::RunnerConfig;

pub use container::{
    ContainerEvent, ContainerRole, ContainerRoleRunner, ContainerRuntime, ContainerSettings,
    ContainerSpec, DiskUsage, RuntimeError, StoragePolicy,
};
pub use docker::DockerEngine;
pub use in_process::{InProcessRole, InProcessRoleRunner};

/// Result type alias for backend operations
pub type RunnerResult<T> = Result<T, RunnerError>;

const STOPPED_CHANNEL_CAPACITY: usize = 64;

/// Backend-specific reference to a running instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionToken {
    Container { container_id: String },
    InProcess { executable: String, task_id: u64 },
}

/// A running role instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoleHandle {
    pub role_id: String,
    pub token: ExecutionToken,
}

/// Why a role left the running set
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// Stopped through [`RoleBackend::stop`] or backend shutdown
    Requested,

    /// The instance ended by itself
    Exited,

    /// The instance ended with an error
    Failed(String),
}

/// Emitted after a role has been removed from a backend's running set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleStopped {
    pub role_id: String,
    pub reason: StopReason,
}

/// A role ready to hand to a backend, one variant per payload kind
#[derive(Debug)]
pub enum RoleInstance {
    Container(ContainerRole),
    InProcess(InProcessRole),
}

/// Errors returned by role backends
#[derive(Debug)]
pub enum RunnerError {
    /// The role already has a running instance on this backend
    AlreadyRunning(String),

    /// The role has no running instance on this backend
    NotRunning(String),

    /// No backend for this payload kind is configured on the device
    BackendUnavailable(&'static str),

    /// The container runtime refused or failed the request
    Runtime(RuntimeError),
}

impl fmt::Display for RunnerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunnerError::AlreadyRunning(role) => write!(f, "role {role} is already running"),
            RunnerError::NotRunning(role) => write!(f, "role {role} is not running"),
            RunnerError::BackendUnavailable(kind) => {
                write!(f, "no {kind} backend configured on this device")
            }
            RunnerError::Runtime(err) => write!(f, "container runtime error: {err}"),
        }
    }
}

impl std::error::Error for RunnerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RunnerError::Runtime(err) => Some(err),
            _ => None,
        }
    }
}

impl From<RuntimeError> for RunnerError {
    fn from(err: RuntimeError) -> Self {
        RunnerError::Runtime(err)
    }
}

/// Common contract of the execution backends
#[async_trait]
pub trait RoleBackend: Send + Sync {
    /// What the backend needs to launch an instance
    type Role: Send + 'static;

    async fn start(&self, role_id: &str, role: Self::Role) -> RunnerResult<RoleHandle>;

    async fn stop(&self, handle: &RoleHandle) -> RunnerResult<()>;

    fn running(&self) -> Vec<RoleHandle>;

    /// Notifications for every role that leaves the running set
    fn stopped_events(&self) -> broadcast::Receiver<RoleStopped>;

    /// Stop everything and release backend resources
    async fn shutdown(&self);
}

/// Per-role async locks so start and stop of one role never interleave
#[derive(Debug, Default)]
pub(crate) struct RoleLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl RoleLocks {
    pub(crate) async fn lock(&self, role_id: &str) -> OwnedMutexGuard<()> {
        let lock = Arc::clone(self.locks.lock().entry(role_id.to_string()).or_default());
        lock.lock_owned().await
    }
}

/// Both backends behind one device-facing API
pub struct RoleRunner {
    in_process: InProcessRoleRunner,
    container: Option<ContainerRoleRunner>,
    stopped: broadcast::Sender<RoleStopped>,
}

impl RoleRunner {
    /// Runner with in-process execution only
    pub fn new(config: &RunnerConfig) -> Self {
        let (stopped, _) = broadcast::channel(STOPPED_CHANNEL_CAPACITY);
        Self {
            in_process: InProcessRoleRunner::new(config, stopped.clone()),
            container: None,
            stopped,
        }
    }

    /// Runner that also launches container roles through `runtime`
    ///
    /// Spawns the container event watcher, so it must be called inside a
    /// tokio runtime.
    pub fn with_containers(
        config: &RunnerConfig,
        runtime: Arc<dyn ContainerRuntime>,
        settings: ContainerSettings,
    ) -> Self {
        let mut runner = Self::new(config);
        runner.container = Some(ContainerRoleRunner::new(
            runtime,
            settings,
            runner.stopped.clone(),
        ));
        runner
    }

    pub async fn start(&self, role_id: &str, instance: RoleInstance) -> RunnerResult<RoleHandle> {
        match instance {
            RoleInstance::Container(role) => {
                self.container_backend()?.start(role_id, role).await
            }
            RoleInstance::InProcess(role) => self.in_process.start(role_id, role).await,
        }
    }

    pub async fn stop(&self, handle: &RoleHandle) -> RunnerResult<()> {
        match handle.token {
            ExecutionToken::Container { .. } => self.container_backend()?.stop(handle).await,
            ExecutionToken::InProcess { .. } => self.in_process.stop(handle).await,
        }
    }

    /// Running roles keyed by role id
    pub fn running_roles(&self) -> BTreeMap<String, RoleHandle> {
        let container = self
            .container
            .iter()
            .flat_map(|backend| backend.running());

        self.in_process
            .running()
            .into_iter()
            .chain(container)
            .map(|handle| (handle.role_id.clone(), handle))
            .collect()
    }

    pub fn is_running(&self, role_id: &str) -> bool {
        self.running_roles().contains_key(role_id)
    }

    pub fn stopped_events(&self) -> broadcast::Receiver<RoleStopped> {
        self.stopped.subscribe()
    }

    pub fn supports_containers(&self) -> bool {
        self.container.is_some()
    }

    /// Stop every role on every backend
    pub async fn shutdown(&self) {
        debug!("shutting down role backends");
        self.in_process.shutdown().await;
        if let Some(container) = &self.container {
            container.shutdown().await;
        }
    }

    fn container_backend(&self) -> RunnerResult<&ContainerRoleRunner> {
        self.container
            .as_ref()
            .ok_or(RunnerError::BackendUnavailable("container"))
    }
}
