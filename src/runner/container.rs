//! Container-backed roles
//!
//! The runner talks to the engine through [`ContainerRuntime`]; the
//! production implementation is [`DockerEngine`](super::DockerEngine).
//! A background watcher follows the engine's event stream so containers that
//! die on their own leave the running set just like explicitly stopped ones.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use super::{
    ExecutionToken, RoleBackend, RoleHandle, RoleLocks, RoleStopped, RunnerError, RunnerResult,
    StopReason,
};

/// Result type alias for container runtime calls
pub type RuntimeResult<T> = Result<T, RuntimeError>;

const EVENTS_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Errors reported by a container runtime
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeError {
    /// The image is not present locally
    ImageNotFound(String),

    /// The container or image does not exist
    NotFound(String),

    /// Nothing to do, e.g. stopping a container that already stopped
    NotModified,

    /// The engine rejected the request (conflicts, bad references, failed pulls)
    Client(String),

    /// The engine failed internally
    Server(String),

    /// The engine could not be reached
    Transport(String),

    /// The engine answered with something unexpected
    Decode(String),
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeError::ImageNotFound(image) => write!(f, "image not found: {image}"),
            RuntimeError::NotFound(what) => write!(f, "not found: {what}"),
            RuntimeError::NotModified => write!(f, "not modified"),
            RuntimeError::Client(msg) => write!(f, "request rejected: {msg}"),
            RuntimeError::Server(msg) => write!(f, "engine error: {msg}"),
            RuntimeError::Transport(msg) => write!(f, "engine unreachable: {msg}"),
            RuntimeError::Decode(msg) => write!(f, "unexpected engine response: {msg}"),
        }
    }
}

impl std::error::Error for RuntimeError {}

/// What to create
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerSpec {
    pub image: String,
    pub env: Vec<String>,
    pub network_mode: String,
}

/// Lifecycle notification from the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerEvent {
    Died { container_id: String },
    Destroyed { container_id: String },
    Other { action: String, container_id: String },
}

/// Space used by images and containers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiskUsage {
    pub images: u64,
    pub containers: u64,
}

impl DiskUsage {
    pub fn total(&self) -> u64 {
        self.images.saturating_add(self.containers)
    }
}

/// Container engine operations the runner relies on
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create a container and return its id
    async fn create_container(&self, spec: &ContainerSpec) -> RuntimeResult<String>;

    async fn start_container(&self, id: &str) -> RuntimeResult<()>;

    async fn stop_container(&self, id: &str) -> RuntimeResult<()>;

    async fn remove_container(&self, id: &str) -> RuntimeResult<()>;

    async fn pull_image(&self, image: &str) -> RuntimeResult<()>;

    /// Container lifecycle events from now on
    async fn events(&self) -> RuntimeResult<BoxStream<'static, RuntimeResult<ContainerEvent>>>;

    async fn disk_usage(&self) -> RuntimeResult<DiskUsage>;

    /// Remove stopped containers and unused images older than `until`,
    /// returning reclaimed bytes
    async fn prune(&self, until: &str) -> RuntimeResult<u64>;
}

/// Image-space housekeeping after each container start
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoragePolicy {
    #[serde(default)]
    pub prune: bool,

    /// Prune when images plus containers exceed this many bytes
    #[serde(default = "default_limit_bytes")]
    pub limit_bytes: u64,

    /// Age filter handed to the engine's prune calls
    #[serde(default = "default_prune_until")]
    pub until: String,
}

fn default_limit_bytes() -> u64 {
    2 * 1024 * 1024 * 1024
}

fn default_prune_until() -> String {
    "1h".to_string()
}

impl Default for StoragePolicy {
    fn default() -> Self {
        Self {
            prune: false,
            limit_bytes: default_limit_bytes(),
            until: default_prune_until(),
        }
    }
}

/// Device identity injected into every container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSettings {
    /// Address containers use to reach the coordination point
    pub platform_host: String,
    pub hostname: String,
    pub storage: StoragePolicy,
}

/// Payload of a container role
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerRole {
    pub image: String,
}

type RunningContainers = Arc<Mutex<HashMap<String, String>>>;

/// Runs roles as containers
pub struct ContainerRoleRunner {
    runtime: Arc<dyn ContainerRuntime>,
    settings: ContainerSettings,
    /// role id -> container id
    running: RunningContainers,
    locks: RoleLocks,
    stopped: broadcast::Sender<RoleStopped>,
    watcher_cancel: CancellationToken,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl ContainerRoleRunner {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        settings: ContainerSettings,
        stopped: broadcast::Sender<RoleStopped>,
    ) -> Self {
        let running: RunningContainers = Arc::new(Mutex::new(HashMap::new()));
        let watcher_cancel = CancellationToken::new();

        let watcher = tokio::spawn(watch_events(
            Arc::clone(&runtime),
            Arc::clone(&running),
            stopped.clone(),
            watcher_cancel.clone(),
        ));

        Self {
            runtime,
            settings,
            running,
            locks: RoleLocks::default(),
            stopped,
            watcher_cancel,
            watcher: Mutex::new(Some(watcher)),
        }
    }

    fn spec(&self, image: &str) -> ContainerSpec {
        ContainerSpec {
            image: image.to_string(),
            env: vec![
                format!("DCP_IP_ADDRESS={}", self.settings.platform_host),
                format!("HOSTNAME={}", self.settings.hostname),
            ],
            network_mode: "host".to_string(),
        }
    }

    /// Create the container, pulling the image first when it is missing
    async fn create(&self, spec: &ContainerSpec) -> RunnerResult<String> {
        match self.runtime.create_container(spec).await {
            Ok(id) => Ok(id),
            Err(RuntimeError::ImageNotFound(_)) => {
                info!(image = %spec.image, "image missing locally, pulling");
                match self.runtime.pull_image(&spec.image).await {
                    Ok(()) => {}
                    // a concurrent pull of the same image fails this one
                    Err(RuntimeError::Client(msg)) => {
                        warn!(image = %spec.image, "pull reported {msg}, retrying create");
                    }
                    Err(e) => return Err(e.into()),
                }
                Ok(self.runtime.create_container(spec).await?)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Stop then remove; both steps tolerate a container that is already gone
    async fn teardown(&self, container_id: &str) {
        match self.runtime.stop_container(container_id).await {
            Ok(()) => debug!(container_id, "container stopped"),
            Err(RuntimeError::NotModified) => debug!(container_id, "container already stopped"),
            Err(e) => warn!(container_id, "failed to stop container: {e}"),
        }
        remove_best_effort(self.runtime.as_ref(), container_id).await;
    }

    async fn manage_storage(&self) {
        let policy = &self.settings.storage;
        if !policy.prune {
            return;
        }

        let usage = match self.runtime.disk_usage().await {
            Ok(usage) => usage,
            Err(e) => {
                warn!("failed to read container disk usage: {e}");
                return;
            }
        };
        trace!(?usage, limit = policy.limit_bytes, "checked container disk usage");

        if usage.total() <= policy.limit_bytes {
            return;
        }

        match self.runtime.prune(&policy.until).await {
            Ok(reclaimed) => info!("pruned container storage, reclaimed {reclaimed} bytes"),
            Err(e) => warn!("failed to prune container storage: {e}"),
        }
    }
}

#[async_trait]
impl RoleBackend for ContainerRoleRunner {
    type Role = ContainerRole;

    #[instrument(skip(self, role), fields(image = %role.image))]
    async fn start(&self, role_id: &str, role: ContainerRole) -> RunnerResult<RoleHandle> {
        let _guard = self.locks.lock(role_id).await;

        if self.running.lock().contains_key(role_id) {
            return Err(RunnerError::AlreadyRunning(role_id.to_string()));
        }

        let spec = self.spec(&role.image);
        let container_id = self.create(&spec).await?;

        // record before starting so a container that dies at once is still
        // matched by the event watcher
        self.running
            .lock()
            .insert(role_id.to_string(), container_id.clone());

        if let Err(e) = self.runtime.start_container(&container_id).await {
            self.running.lock().remove(role_id);
            remove_best_effort(self.runtime.as_ref(), &container_id).await;
            return Err(e.into());
        }
        info!(role = role_id, container_id, "started container role");

        self.manage_storage().await;

        Ok(RoleHandle {
            role_id: role_id.to_string(),
            token: ExecutionToken::Container { container_id },
        })
    }

    #[instrument(skip(self, handle), fields(role = %handle.role_id))]
    async fn stop(&self, handle: &RoleHandle) -> RunnerResult<()> {
        let _guard = self.locks.lock(&handle.role_id).await;

        let container_id = self
            .running
            .lock()
            .remove(&handle.role_id)
            .ok_or_else(|| RunnerError::NotRunning(handle.role_id.clone()))?;

        self.teardown(&container_id).await;

        let _ = self.stopped.send(RoleStopped {
            role_id: handle.role_id.clone(),
            reason: StopReason::Requested,
        });
        info!(container_id, "stopped container role");
        Ok(())
    }

    fn running(&self) -> Vec<RoleHandle> {
        self.running
            .lock()
            .iter()
            .map(|(role_id, container_id)| RoleHandle {
                role_id: role_id.clone(),
                token: ExecutionToken::Container {
                    container_id: container_id.clone(),
                },
            })
            .collect()
    }

    fn stopped_events(&self) -> broadcast::Receiver<RoleStopped> {
        self.stopped.subscribe()
    }

    async fn shutdown(&self) {
        self.watcher_cancel.cancel();
        let watcher = self.watcher.lock().take();
        if let Some(watcher) = watcher {
            let _ = watcher.await;
        }

        let containers: Vec<(String, String)> = self.running.lock().drain().collect();
        debug!("removing {} containers", containers.len());
        for (role_id, container_id) in containers {
            self.teardown(&container_id).await;
            let _ = self.stopped.send(RoleStopped {
                role_id,
                reason: StopReason::Requested,
            });
        }
    }
}

async fn remove_best_effort(runtime: &dyn ContainerRuntime, container_id: &str) {
    match runtime.remove_container(container_id).await {
        Ok(()) => debug!(container_id, "container removed"),
        Err(RuntimeError::NotFound(_)) => debug!(container_id, "container already removed"),
        Err(e) => warn!(container_id, "failed to remove container: {e}"),
    }
}

/// Follow engine events until cancelled, reconnecting after stream failures
async fn watch_events(
    runtime: Arc<dyn ContainerRuntime>,
    running: RunningContainers,
    stopped: broadcast::Sender<RoleStopped>,
    cancel: CancellationToken,
) {
    debug!("starting container event watcher");

    while !cancel.is_cancelled() {
        let mut events = tokio::select! {
            _ = cancel.cancelled() => break,
            events = runtime.events() => match events {
                Ok(events) => events,
                Err(e) => {
                    warn!("failed to open container event stream: {e}");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(EVENTS_RETRY_DELAY) => continue,
                    }
                }
            },
        };

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.next() => event,
            };

            match event {
                Some(Ok(ContainerEvent::Died { container_id })) => {
                    if let Some(role_id) = take_role(&running, &container_id) {
                        info!(role = %role_id, container_id, "container died");
                        remove_best_effort(runtime.as_ref(), &container_id).await;
                        let _ = stopped.send(RoleStopped {
                            role_id,
                            reason: StopReason::Exited,
                        });
                    }
                }
                Some(Ok(ContainerEvent::Destroyed { container_id })) => {
                    if let Some(role_id) = take_role(&running, &container_id) {
                        info!(role = %role_id, container_id, "container removed externally");
                        let _ = stopped.send(RoleStopped {
                            role_id,
                            reason: StopReason::Exited,
                        });
                    }
                }
                Some(Ok(ContainerEvent::Other { action, container_id })) => {
                    trace!(action, container_id, "ignoring container event");
                }
                Some(Err(e)) => {
                    warn!("container event stream failed: {e}");
                    break;
                }
                None => {
                    debug!("container event stream ended");
                    break;
                }
            }
        }
    }

    debug!("container event watcher stopped");
}

fn take_role(running: &RunningContainers, container_id: &str) -> Option<String> {
    let mut running = running.lock();
    let role_id = running
        .iter()
        .find(|(_, id)| id.as_str() == container_id)
        .map(|(role_id, _)| role_id.clone())?;
    running.remove(&role_id);
    Some(role_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use std::collections::VecDeque;
    use tokio::sync::mpsc;

    /// Scripted runtime recording every call
    #[derive(Default)]
    struct FakeRuntime {
        calls: Mutex<Vec<String>>,
        create_results: Mutex<VecDeque<RuntimeResult<String>>>,
        pull_result: Mutex<Option<RuntimeResult<()>>>,
        stop_result: Mutex<Option<RuntimeResult<()>>>,
        usage: Mutex<DiskUsage>,
        events_tx: Mutex<Option<mpsc::UnboundedSender<RuntimeResult<ContainerEvent>>>>,
    }

    impl FakeRuntime {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }

        fn record(&self, call: String) {
            self.calls.lock().push(call);
        }

        fn emit(&self, event: ContainerEvent) {
            if let Some(tx) = self.events_tx.lock().as_ref() {
                tx.send(Ok(event)).unwrap();
            }
        }
    }

    #[async_trait]
    impl ContainerRuntime for FakeRuntime {
        async fn create_container(&self, spec: &ContainerSpec) -> RuntimeResult<String> {
            self.record(format!("create {}", spec.image));
            self.create_results
                .lock()
                .pop_front()
                .unwrap_or_else(|| Ok(format!("{}-container", spec.image)))
        }

        async fn start_container(&self, id: &str) -> RuntimeResult<()> {
            self.record(format!("start {id}"));
            Ok(())
        }

        async fn stop_container(&self, id: &str) -> RuntimeResult<()> {
            self.record(format!("stop {id}"));
            self.stop_result.lock().take().unwrap_or(Ok(()))
        }

        async fn remove_container(&self, id: &str) -> RuntimeResult<()> {
            self.record(format!("remove {id}"));
            Ok(())
        }

        async fn pull_image(&self, image: &str) -> RuntimeResult<()> {
            self.record(format!("pull {image}"));
            self.pull_result.lock().take().unwrap_or(Ok(()))
        }

        async fn events(&self) -> RuntimeResult<BoxStream<'static, RuntimeResult<ContainerEvent>>> {
            let (tx, rx) = mpsc::unbounded_channel();
            *self.events_tx.lock() = Some(tx);
            let stream = futures::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|event| (event, rx))
            });
            Ok(stream.boxed())
        }

        async fn disk_usage(&self) -> RuntimeResult<DiskUsage> {
            self.record("df".to_string());
            Ok(*self.usage.lock())
        }

        async fn prune(&self, until: &str) -> RuntimeResult<u64> {
            self.record(format!("prune {until}"));
            Ok(1024)
        }
    }

    fn settings(prune: bool) -> ContainerSettings {
        ContainerSettings {
            platform_host: "10.0.0.1".to_string(),
            hostname: "edge-1".to_string(),
            storage: StoragePolicy {
                prune,
                limit_bytes: 100,
                until: "1h".to_string(),
            },
        }
    }

    fn runner(runtime: &Arc<FakeRuntime>, prune: bool) -> ContainerRoleRunner {
        let (tx, _) = broadcast::channel(16);
        let runtime: Arc<dyn ContainerRuntime> = Arc::clone(runtime) as Arc<dyn ContainerRuntime>;
        ContainerRoleRunner::new(runtime, settings(prune), tx)
    }

    fn detector() -> ContainerRole {
        ContainerRole {
            image: "detector".to_string(),
        }
    }

    #[tokio::test]
    async fn test_spec_injects_device_identity() {
        let runtime = Arc::new(FakeRuntime::default());
        let runner = runner(&runtime, false);

        let spec = runner.spec("detector");

        assert_eq!(
            spec.env,
            vec!["DCP_IP_ADDRESS=10.0.0.1".to_string(), "HOSTNAME=edge-1".to_string()]
        );
        assert_eq!(spec.network_mode, "host");
    }

    #[tokio::test]
    async fn test_start_creates_and_starts() {
        let runtime = Arc::new(FakeRuntime::default());
        let runner = runner(&runtime, false);

        let handle = runner.start("det", detector()).await.unwrap();

        assert_eq!(
            handle.token,
            ExecutionToken::Container {
                container_id: "detector-container".to_string()
            }
        );
        assert_eq!(runtime.calls(), vec!["create detector", "start detector-container"]);
        assert_eq!(runner.running(), vec![handle]);
    }

    #[tokio::test]
    async fn test_missing_image_is_pulled_then_created() {
        let runtime = Arc::new(FakeRuntime::default());
        runtime
            .create_results
            .lock()
            .push_back(Err(RuntimeError::ImageNotFound("detector".to_string())));
        let runner = runner(&runtime, false);

        runner.start("det", detector()).await.unwrap();

        assert_eq!(
            runtime.calls(),
            vec![
                "create detector",
                "pull detector",
                "create detector",
                "start detector-container"
            ]
        );
    }

    #[tokio::test]
    async fn test_rejected_pull_still_retries_create() {
        let runtime = Arc::new(FakeRuntime::default());
        runtime
            .create_results
            .lock()
            .push_back(Err(RuntimeError::ImageNotFound("detector".to_string())));
        *runtime.pull_result.lock() = Some(Err(RuntimeError::Client("already exists".to_string())));
        let runner = runner(&runtime, false);

        assert!(runner.start("det", detector()).await.is_ok());
    }

    #[tokio::test]
    async fn test_pull_transport_failure_leaves_role_unstarted() {
        let runtime = Arc::new(FakeRuntime::default());
        runtime
            .create_results
            .lock()
            .push_back(Err(RuntimeError::ImageNotFound("detector".to_string())));
        *runtime.pull_result.lock() = Some(Err(RuntimeError::Transport("refused".to_string())));
        let runner = runner(&runtime, false);

        let result = runner.start("det", detector()).await;

        assert_matches!(result, Err(RunnerError::Runtime(RuntimeError::Transport(_))));
        assert!(runner.running().is_empty());
    }

    #[tokio::test]
    async fn test_stop_tolerates_already_stopped_container() {
        let runtime = Arc::new(FakeRuntime::default());
        let runner = runner(&runtime, false);
        let handle = runner.start("det", detector()).await.unwrap();
        *runtime.stop_result.lock() = Some(Err(RuntimeError::NotModified));

        runner.stop(&handle).await.unwrap();

        assert!(runner.running().is_empty());
        assert_eq!(
            runtime.calls()[2..],
            ["stop detector-container", "remove detector-container"]
        );
    }

    #[tokio::test]
    async fn test_died_event_clears_running_entry() {
        let runtime = Arc::new(FakeRuntime::default());
        let runner = runner(&runtime, false);
        let mut events = runner.stopped_events();
        while runtime.events_tx.lock().is_none() {
            tokio::task::yield_now().await;
        }
        runner.start("det", detector()).await.unwrap();

        runtime.emit(ContainerEvent::Died {
            container_id: "detector-container".to_string(),
        });

        let event = events.recv().await.unwrap();
        assert_eq!(
            event,
            RoleStopped {
                role_id: "det".to_string(),
                reason: StopReason::Exited,
            }
        );
        assert!(runner.running().is_empty());
        runner.shutdown().await;
    }

    #[tokio::test]
    async fn test_storage_pruned_only_when_enabled_and_over_limit() {
        let runtime = Arc::new(FakeRuntime::default());
        *runtime.usage.lock() = DiskUsage {
            images: 80,
            containers: 40,
        };

        let disabled = runner(&runtime, false);
        disabled.start("a", detector()).await.unwrap();
        assert!(!runtime.calls().iter().any(|c| c.starts_with("prune")));

        let enabled = runner(&runtime, true);
        enabled.start("b", detector()).await.unwrap();
        assert!(runtime.calls().contains(&"prune 1h".to_string()));
    }
}
