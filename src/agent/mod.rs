//! Device-side scheduling
//!
//! A [`Device`] keeps a [`ServiceDirectory`] in sync with the coordination
//! point and periodically asks its [`RoleFinder`] which roles to start and
//! which to give up.
//!
//! ```text
//!   platform ──service changes──► ServiceDirectory
//!                                       │ role definitions
//!   DeviceActor ──tick / command──► RoleFinder ──start/stop──► RoleRunner
//!                                       │
//!                                       └── metric gates ──► platform
//! ```

pub mod device;
pub mod directory;
pub mod finder;
pub mod messages;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use device::{Device, DeviceConfig, DeviceHandle, DeviceState};
pub use directory::ServiceDirectory;
pub use finder::{AdmissionReport, RoleFinder};

/// Admission policy of a device, fixed for its lifetime
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Run every eligible role and never give one up
    #[default]
    Eager,

    /// Run a gated role only while one of its gates is violated, stop it once
    /// all gates hold and it is idle
    Lazy,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::Eager => f.write_str("EAGER"),
            Strategy::Lazy => f.write_str("LAZY"),
        }
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "eager" => Ok(Strategy::Eager),
            "lazy" => Ok(Strategy::Lazy),
            other => Err(format!("unknown strategy: {other}")),
        }
    }
}
