//! In-process execution of role programs
//!
//! Each started role becomes a tokio task that waits for a slot in a bounded
//! pool, then runs its [`RoleProgram`]. Stopping is cooperative: the role's
//! cancellation token is triggered and the task gets `stop_timeout` to wind
//! down before it is aborted.
//!
//! ```text
//! start ──► running[role] ──► task: acquire permit ─► program.run(ctx, token)
//!                 ▲                                          │
//!                 └── removed on completion (Exited/Failed) ─┘
//! stop  ──► remove running[role] ─► cancel ─► wait ≤ stop_timeout ─► abort
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{Semaphore, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::{
    ExecutionToken, RoleBackend, RoleHandle, RoleLocks, RoleStopped, RunnerError, RunnerResult,
    StopReason,
};
use crate::config::RunnerConfig;
use crate::role::{RoleContext, RoleProgram};

/// An instantiated in-process role
#[derive(Debug)]
pub struct InProcessRole {
    pub executable: String,
    pub program: RoleProgram,
    pub context: RoleContext,
}

struct RunningTask {
    handle: RoleHandle,
    task_id: u64,
    cancel: CancellationToken,
    join: Option<JoinHandle<()>>,
}

type RunningMap = Arc<Mutex<HashMap<String, RunningTask>>>;

/// Bounded pool running [`RoleProgram`]s
pub struct InProcessRoleRunner {
    pool: Arc<Semaphore>,
    running: RunningMap,
    locks: RoleLocks,
    stop_timeout: Duration,
    next_task_id: AtomicU64,
    stopped: broadcast::Sender<RoleStopped>,
}

impl InProcessRoleRunner {
    pub fn new(config: &RunnerConfig, stopped: broadcast::Sender<RoleStopped>) -> Self {
        Self {
            pool: Arc::new(Semaphore::new(config.pool_size.max(1))),
            running: Arc::new(Mutex::new(HashMap::new())),
            locks: RoleLocks::default(),
            stop_timeout: Duration::from_millis(config.stop_timeout_ms),
            next_task_id: AtomicU64::new(1),
            stopped,
        }
    }

    /// Cancel `task` and wait for it, aborting it once the timeout passes
    async fn reclaim(&self, role_id: &str, mut task: RunningTask) {
        task.cancel.cancel();

        let Some(mut join) = task.join.take() else {
            return;
        };

        match tokio::time::timeout(self.stop_timeout, &mut join).await {
            Ok(_) => debug!(role = role_id, "role stopped cooperatively"),
            Err(_) => {
                warn!(
                    role = role_id,
                    "role ignored cancellation for {:?}, aborting",
                    self.stop_timeout
                );
                join.abort();
            }
        }
    }
}

#[async_trait]
impl RoleBackend for InProcessRoleRunner {
    type Role = InProcessRole;

    #[instrument(skip(self, role), fields(executable = %role.executable))]
    async fn start(&self, role_id: &str, role: InProcessRole) -> RunnerResult<RoleHandle> {
        let _guard = self.locks.lock(role_id).await;

        let InProcessRole {
            executable,
            program,
            context,
        } = role;

        let task_id = self.next_task_id.fetch_add(1, Ordering::Relaxed);
        let handle = RoleHandle {
            role_id: role_id.to_string(),
            token: ExecutionToken::InProcess {
                executable,
                task_id,
            },
        };
        let cancel = CancellationToken::new();

        // the completion path takes this same lock, so the entry always
        // exists before the task can try to remove it
        let mut running = self.running.lock();
        if running.contains_key(role_id) {
            return Err(RunnerError::AlreadyRunning(role_id.to_string()));
        }

        let join = tokio::spawn(run_task(
            role_id.to_string(),
            task_id,
            program,
            context,
            cancel.clone(),
            Arc::clone(&self.pool),
            Arc::clone(&self.running),
            self.stopped.clone(),
        ));

        running.insert(
            role_id.to_string(),
            RunningTask {
                handle: handle.clone(),
                task_id,
                cancel,
                join: Some(join),
            },
        );
        info!(role = role_id, task_id, "started in-process role");

        Ok(handle)
    }

    #[instrument(skip(self, handle), fields(role = %handle.role_id))]
    async fn stop(&self, handle: &RoleHandle) -> RunnerResult<()> {
        let _guard = self.locks.lock(&handle.role_id).await;

        let task = self
            .running
            .lock()
            .remove(&handle.role_id)
            .ok_or_else(|| RunnerError::NotRunning(handle.role_id.clone()))?;

        self.reclaim(&handle.role_id, task).await;

        let _ = self.stopped.send(RoleStopped {
            role_id: handle.role_id.clone(),
            reason: StopReason::Requested,
        });
        info!("stopped in-process role");
        Ok(())
    }

    fn running(&self) -> Vec<RoleHandle> {
        self.running
            .lock()
            .values()
            .map(|task| task.handle.clone())
            .collect()
    }

    fn stopped_events(&self) -> broadcast::Receiver<RoleStopped> {
        self.stopped.subscribe()
    }

    async fn shutdown(&self) {
        let tasks: Vec<(String, RunningTask)> = self.running.lock().drain().collect();
        debug!("draining {} in-process roles", tasks.len());

        let reclaims = tasks
            .into_iter()
            .map(|(role_id, task)| async move {
                self.reclaim(&role_id, task).await;
                let _ = self.stopped.send(RoleStopped {
                    role_id,
                    reason: StopReason::Requested,
                });
            });
        futures::future::join_all(reclaims).await;
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_task(
    role_id: String,
    task_id: u64,
    program: RoleProgram,
    context: RoleContext,
    cancel: CancellationToken,
    pool: Arc<Semaphore>,
    running: RunningMap,
    stopped: broadcast::Sender<RoleStopped>,
) {
    let permit = tokio::select! {
        _ = cancel.cancelled() => return,
        permit = pool.acquire_owned() => permit,
    };
    let Ok(_permit) = permit else {
        error!(role = %role_id, "worker pool closed");
        return;
    };

    let reason = match program.run(context, cancel).await {
        Ok(()) => StopReason::Exited,
        Err(e) => {
            warn!(role = %role_id, "role failed: {e:#}");
            StopReason::Failed(format!("{e:#}"))
        }
    };

    // a requested stop already took the entry out
    let removed = {
        let mut running = running.lock();
        match running.get(&role_id) {
            Some(task) if task.task_id == task_id => running.remove(&role_id).is_some(),
            _ => false,
        }
    };

    if removed {
        info!(role = %role_id, ?reason, "in-process role ended on its own");
        let _ = stopped.send(RoleStopped { role_id, reason });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{LocalClient, Platform, PlatformClient};
    use assert_matches::assert_matches;
    use std::sync::atomic::AtomicBool;

    fn config(stop_timeout_ms: u64) -> RunnerConfig {
        RunnerConfig {
            pool_size: 2,
            stop_timeout_ms,
            ..RunnerConfig::default()
        }
    }

    fn runner(stop_timeout_ms: u64) -> InProcessRoleRunner {
        let (tx, _) = broadcast::channel(16);
        InProcessRoleRunner::new(&config(stop_timeout_ms), tx)
    }

    fn role(program: RoleProgram) -> InProcessRole {
        let platform = Arc::new(Platform::new());
        let client: Arc<dyn PlatformClient> = Arc::new(LocalClient::new(platform, "local"));
        InProcessRole {
            executable: "test".to_string(),
            program,
            context: RoleContext::new("role", "host", client),
        }
    }

    fn cooperative() -> RoleProgram {
        RoleProgram::builder()
            .body(|cancel| async move {
                cancel.cancelled().await;
                Ok(())
            })
            .build()
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let runner = runner(1000);
        let mut events = runner.stopped_events();

        let handle = runner.start("a", role(cooperative())).await.unwrap();
        assert_eq!(runner.running(), vec![handle.clone()]);

        runner.stop(&handle).await.unwrap();

        assert!(runner.running().is_empty());
        let event = events.recv().await.unwrap();
        assert_eq!(event.reason, StopReason::Requested);
    }

    #[tokio::test]
    async fn test_second_start_of_same_role_is_rejected() {
        let runner = runner(1000);
        runner.start("a", role(cooperative())).await.unwrap();

        let second = runner.start("a", role(cooperative())).await;

        assert_matches!(second, Err(RunnerError::AlreadyRunning(id)) if id == "a");
        runner.shutdown().await;
    }

    #[tokio::test]
    async fn test_self_termination_is_reported() {
        let runner = runner(1000);
        let mut events = runner.stopped_events();
        let failing = RoleProgram::builder()
            .body(|_| async { Err(anyhow::anyhow!("camera unplugged")) })
            .build();

        runner.start("a", role(failing)).await.unwrap();

        let event = events.recv().await.unwrap();
        assert_eq!(event.role_id, "a");
        assert_matches!(event.reason, StopReason::Failed(msg) if msg.contains("camera unplugged"));
        assert!(runner.running().is_empty());
    }

    #[tokio::test]
    async fn test_uncooperative_role_is_aborted_after_timeout() {
        let runner = runner(50);
        let finished = Arc::new(AtomicBool::new(false));
        let stubborn = {
            let finished = Arc::clone(&finished);
            RoleProgram::builder()
                .body(move |_| async move {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    finished.store(true, Ordering::SeqCst);
                    Ok(())
                })
                .build()
        };

        let handle = runner.start("a", role(stubborn)).await.unwrap();
        let started = tokio::time::Instant::now();
        runner.stop(&handle).await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(runner.running().is_empty());
        assert!(!finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_pool_bounds_concurrency() {
        let runner = runner(1000);
        let active = Arc::new(AtomicU64::new(0));
        let peak = Arc::new(AtomicU64::new(0));

        for name in ["a", "b", "c", "d"] {
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            let program = RoleProgram::builder()
                .body(move |_| async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
                .build();
            runner.start(name, role(program)).await.unwrap();
        }

        while !runner.running().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_shutdown_drains_everything() {
        let runner = runner(1000);
        runner.start("a", role(cooperative())).await.unwrap();
        runner.start("b", role(cooperative())).await.unwrap();

        runner.shutdown().await;

        assert!(runner.running().is_empty());
    }

    #[tokio::test]
    async fn test_stop_unknown_role() {
        let runner = runner(1000);
        let handle = RoleHandle {
            role_id: "ghost".to_string(),
            token: ExecutionToken::InProcess {
                executable: "test".to_string(),
                task_id: 99,
            },
        };

        assert_matches!(runner.stop(&handle).await, Err(RunnerError::NotRunning(_)));
    }
}
