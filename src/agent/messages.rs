//! Commands accepted by the device actor

use std::collections::BTreeMap;

use tokio::sync::oneshot;

use super::finder::AdmissionReport;
use crate::runner::RoleHandle;

#[derive(Debug)]
pub enum DeviceCommand {
    /// Run an admission pass now instead of waiting for the next tick
    TryRunRoles {
        respond_to: oneshot::Sender<AdmissionReport>,
    },

    CurrentRoles {
        respond_to: oneshot::Sender<BTreeMap<String, RoleHandle>>,
    },

    /// Cancel the timer, drain the backends and close the platform connection
    ///
    /// Answered once teardown has finished.
    Disconnect { respond_to: oneshot::Sender<()> },
}
