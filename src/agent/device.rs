//! Device lifecycle
//!
//! `Created → Started → Disconnected`. [`Device::start`] registers with the
//! coordination point, runs the first admission pass and hands the device to
//! an actor that re-runs the pass every period. Admission passes, commands
//! and teardown all execute on that actor, so a disconnect never overlaps a
//! pass: the in-flight pass finishes, the timer is dropped, then the
//! backends drain.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, info, instrument, warn};

use super::Strategy;
use super::directory::ServiceDirectory;
use super::finder::{AdmissionReport, RoleFinder};
use super::messages::DeviceCommand;
use crate::platform::PlatformClient;
use crate::role::{Requirement, RoleRegistry};
use crate::runner::{RoleHandle, RoleRunner, StopReason};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Created,
    Started,
    Disconnected,
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceState::Created => f.write_str("created"),
            DeviceState::Started => f.write_str("started"),
            DeviceState::Disconnected => f.write_str("disconnected"),
        }
    }
}

/// Identity and policy of a device
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub hostname: String,
    pub strategy: Strategy,
    pub features: BTreeSet<Requirement>,
    /// Time between admission passes
    pub period: Duration,
}

/// A device that has not been started yet
pub struct Device {
    config: DeviceConfig,
    client: Arc<dyn PlatformClient>,
    runner: Arc<RoleRunner>,
    directory: ServiceDirectory,
    finder: RoleFinder,
    state_tx: watch::Sender<DeviceState>,
}

impl Device {
    pub fn new(
        config: DeviceConfig,
        client: Arc<dyn PlatformClient>,
        runner: Arc<RoleRunner>,
        registry: Arc<RoleRegistry>,
    ) -> Self {
        let finder = RoleFinder::new(
            config.hostname.clone(),
            config.strategy,
            config.features.clone(),
            Arc::clone(&client),
            Arc::clone(&runner),
            registry,
        );
        let (state_tx, _) = watch::channel(DeviceState::Created);

        Self {
            config,
            client,
            runner,
            directory: ServiceDirectory::new(),
            finder,
            state_tx,
        }
    }

    pub fn state(&self) -> DeviceState {
        *self.state_tx.borrow()
    }

    /// Register, run the first admission pass and arm the periodic timer
    #[instrument(skip(self), fields(hostname = %self.config.hostname))]
    pub async fn start(self) -> Result<DeviceHandle> {
        self.directory
            .register(self.client.as_ref())
            .await
            .context("could not register device")?;

        let report = self
            .finder
            .try_roles(&self.directory.role_definitions())
            .await;
        debug!(started = report.started.len(), "initial admission pass done");

        self.state_tx.send_replace(DeviceState::Started);
        info!(
            strategy = %self.config.strategy,
            features = ?self.config.features,
            "device started"
        );

        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let state_rx = self.state_tx.subscribe();
        let hostname = self.config.hostname.clone();

        let actor = DeviceActor {
            period: self.config.period,
            client: self.client,
            runner: self.runner,
            directory: self.directory,
            finder: self.finder,
            state_tx: self.state_tx,
            command_rx: cmd_rx,
        };
        tokio::spawn(actor.run());

        Ok(DeviceHandle {
            sender: cmd_tx,
            state: state_rx,
            hostname,
        })
    }
}

struct DeviceActor {
    period: Duration,
    client: Arc<dyn PlatformClient>,
    runner: Arc<RoleRunner>,
    directory: ServiceDirectory,
    finder: RoleFinder,
    state_tx: watch::Sender<DeviceState>,
    command_rx: mpsc::Receiver<DeviceCommand>,
}

impl DeviceActor {
    #[instrument(skip(self), name = "device")]
    async fn run(mut self) {
        debug!("starting device actor");

        let mut ticker = interval_at(Instant::now() + self.period, self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut stopped = self.runner.stopped_events();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.try_run_roles().await;
                }

                cmd = self.command_rx.recv() => match cmd {
                    Some(DeviceCommand::TryRunRoles { respond_to }) => {
                        let report = self.try_run_roles().await;
                        let _ = respond_to.send(report);
                    }
                    Some(DeviceCommand::CurrentRoles { respond_to }) => {
                        let _ = respond_to.send(self.runner.running_roles());
                    }
                    Some(DeviceCommand::Disconnect { respond_to }) => {
                        drop(ticker);
                        self.teardown().await;
                        let _ = respond_to.send(());
                        break;
                    }
                    None => {
                        debug!("all device handles dropped");
                        drop(ticker);
                        self.teardown().await;
                        break;
                    }
                },

                event = stopped.recv() => match event {
                    Ok(event) => match event.reason {
                        StopReason::Requested => debug!(role = %event.role_id, "role stopped"),
                        StopReason::Exited => info!(role = %event.role_id, "role exited"),
                        StopReason::Failed(reason) => {
                            warn!(role = %event.role_id, "role failed: {reason}");
                        }
                    },
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("missed {skipped} role stop notifications");
                    }
                    Err(RecvError::Closed) => {
                        stopped = self.runner.stopped_events();
                    }
                },
            }
        }

        self.drain_commands();
        debug!("device actor stopped");
    }

    /// Answer disconnects that queued up behind the one that ended the loop
    fn drain_commands(&mut self) {
        self.command_rx.close();
        while let Ok(cmd) = self.command_rx.try_recv() {
            if let DeviceCommand::Disconnect { respond_to } = cmd {
                let _ = respond_to.send(());
            }
        }
    }

    async fn try_run_roles(&self) -> AdmissionReport {
        let definitions = self.directory.role_definitions();
        self.finder.try_roles(&definitions).await
    }

    async fn teardown(&self) {
        info!("disconnecting device");
        self.runner.shutdown().await;
        self.directory.close().await;
        self.client.close().await;
        self.state_tx.send_replace(DeviceState::Disconnected);
        info!("device disconnected");
    }
}

/// Handle to a started device
#[derive(Clone)]
pub struct DeviceHandle {
    sender: mpsc::Sender<DeviceCommand>,
    state: watch::Receiver<DeviceState>,
    hostname: String,
}

impl DeviceHandle {
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn state(&self) -> DeviceState {
        *self.state.borrow()
    }

    /// Run an admission pass immediately
    pub async fn try_run_roles(&self) -> Result<AdmissionReport> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(DeviceCommand::TryRunRoles { respond_to: tx })
            .await
            .context("failed to send TryRunRoles command")?;

        rx.await.context("failed to receive admission report")
    }

    pub async fn current_roles(&self) -> Result<BTreeMap<String, RoleHandle>> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(DeviceCommand::CurrentRoles { respond_to: tx })
            .await
            .context("failed to send CurrentRoles command")?;

        rx.await.context("failed to receive current roles")
    }

    /// Tear the device down; returns once every role has been stopped
    ///
    /// Calling it again after the device is gone is a no-op.
    pub async fn disconnect(&self) -> Result<()> {
        if self.state() == DeviceState::Disconnected {
            return Ok(());
        }

        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(DeviceCommand::Disconnect { respond_to: tx })
            .await
            .is_err()
        {
            // a concurrent disconnect got there first
            return self.wait_for_shutdown().await;
        }

        rx.await.context("device stopped before confirming disconnect")
    }

    /// Block until the device has been disconnected
    pub async fn wait_for_shutdown(&self) -> Result<()> {
        let mut state = self.state.clone();
        state
            .wait_for(|state| *state == DeviceState::Disconnected)
            .await
            .context("device stopped without disconnecting")?;
        Ok(())
    }
}
