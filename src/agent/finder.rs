//! Admission engine: which roles this device starts and stops
//!
//! One pass is a start pass followed by a stop pass:
//!
//! - **start**: every known role that is not running, whose requirements the
//!   device covers, and which is either wanted unconditionally (eager device,
//!   or no gates) or needed (at least one gate currently unmet)
//! - **stop** (lazy devices only): every running gated role whose gates all
//!   hold and which handled no work in the last few seconds
//!
//! A failure for one role is logged and only affects that role; it is
//! attempted again on the next pass.

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::Context;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use super::Strategy;
use crate::platform::PlatformClient;
use crate::role::{Requirement, RoleContext, RoleDefinition, RolePayload, RoleRegistry};
use crate::runner::{ContainerRole, InProcessRole, RoleInstance, RoleRunner};

/// Outcome of one admission pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AdmissionReport {
    pub started: Vec<String>,
    pub stopped: Vec<String>,
    pub failed: Vec<String>,
}

impl AdmissionReport {
    pub fn is_empty(&self) -> bool {
        self.started.is_empty() && self.stopped.is_empty() && self.failed.is_empty()
    }
}

pub struct RoleFinder {
    hostname: String,
    strategy: Strategy,
    features: BTreeSet<Requirement>,
    client: Arc<dyn PlatformClient>,
    runner: Arc<RoleRunner>,
    registry: Arc<RoleRegistry>,
    /// Serializes passes
    pass: Mutex<()>,
}

impl RoleFinder {
    pub fn new(
        hostname: impl Into<String>,
        strategy: Strategy,
        features: BTreeSet<Requirement>,
        client: Arc<dyn PlatformClient>,
        runner: Arc<RoleRunner>,
        registry: Arc<RoleRegistry>,
    ) -> Self {
        Self {
            hostname: hostname.into(),
            strategy,
            features,
            client,
            runner,
            registry,
            pass: Mutex::new(()),
        }
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn features(&self) -> &BTreeSet<Requirement> {
        &self.features
    }

    /// Run a start pass then a stop pass over `definitions`
    #[instrument(skip_all, fields(strategy = %self.strategy))]
    pub async fn try_roles(&self, definitions: &[RoleDefinition]) -> AdmissionReport {
        let _pass = self.pass.lock().await;
        let mut report = AdmissionReport::default();

        self.start_pass(definitions, &mut report).await;
        self.stop_pass(definitions, &mut report).await;

        if !report.is_empty() {
            info!(
                started = ?report.started,
                stopped = ?report.stopped,
                failed = ?report.failed,
                "admission pass changed roles"
            );
        }
        report
    }

    async fn start_pass(&self, definitions: &[RoleDefinition], report: &mut AdmissionReport) {
        for role in definitions {
            if self.runner.is_running(&role.role_id) {
                continue;
            }

            match self.should_start(role).await {
                Ok(false) => {}
                Ok(true) => match self.start_role(role).await {
                    Ok(()) => report.started.push(role.role_id.clone()),
                    Err(e) => {
                        warn!(role = %role.role_id, "failed to start role: {e:#}");
                        report.failed.push(role.role_id.clone());
                    }
                },
                Err(e) => {
                    warn!(role = %role.role_id, "failed to evaluate role: {e:#}");
                    report.failed.push(role.role_id.clone());
                }
            }
        }
    }

    async fn stop_pass(&self, definitions: &[RoleDefinition], report: &mut AdmissionReport) {
        if self.strategy == Strategy::Eager {
            return;
        }

        for (role_id, handle) in self.runner.running_roles() {
            // roles whose definition disappeared are left alone
            let Some(role) = definitions.iter().find(|d| d.role_id == role_id) else {
                continue;
            };

            match self.should_stop(role).await {
                Ok(false) => {}
                Ok(true) => match self.runner.stop(&handle).await {
                    Ok(()) => report.stopped.push(role_id),
                    Err(e) => {
                        warn!(role = %role_id, "failed to stop role: {e}");
                        report.failed.push(role_id);
                    }
                },
                Err(e) => {
                    warn!(role = %role_id, "failed to evaluate role: {e:#}");
                    report.failed.push(role_id);
                }
            }
        }
    }

    async fn should_start(&self, role: &RoleDefinition) -> anyhow::Result<bool> {
        if !role.is_satisfied_by(&self.features) {
            debug!(role = %role.role_id, "device lacks required features");
            return Ok(false);
        }

        if self.strategy == Strategy::Eager || !role.is_gated() {
            return Ok(true);
        }

        let broken = self.any_gate_unmet(role).await?;
        debug!(role = %role.role_id, broken, "evaluated metric gates");
        Ok(broken)
    }

    async fn should_stop(&self, role: &RoleDefinition) -> anyhow::Result<bool> {
        if !role.is_gated() || self.any_gate_unmet(role).await? {
            return Ok(false);
        }

        let busy = self
            .client
            .has_workload(&self.hostname, &role.role_id)
            .await
            .context("failed to query workload")?;
        debug!(role = %role.role_id, busy, "checked workload");
        Ok(!busy)
    }

    async fn any_gate_unmet(&self, role: &RoleDefinition) -> anyhow::Result<bool> {
        for metric in &role.metrics {
            let met = self
                .client
                .metric_met(metric)
                .await
                .with_context(|| format!("failed to query gate {metric}"))?;
            if !met {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn start_role(&self, role: &RoleDefinition) -> anyhow::Result<()> {
        let instance = self.instantiate(role)?;
        self.runner
            .start(&role.role_id, instance)
            .await
            .with_context(|| format!("backend refused role {}", role.role_id))?;
        Ok(())
    }

    fn instantiate(&self, role: &RoleDefinition) -> anyhow::Result<RoleInstance> {
        let instance = match &role.payload {
            RolePayload::Container { image } => RoleInstance::Container(ContainerRole {
                image: image.clone(),
            }),
            RolePayload::InProcess { executable } => {
                let context =
                    RoleContext::new(&role.role_id, &self.hostname, Arc::clone(&self.client));
                let program = self.registry.instantiate(executable, &context)?;
                RoleInstance::InProcess(InProcessRole {
                    executable: executable.clone(),
                    program,
                    context,
                })
            }
        };
        Ok(instance)
    }
}
