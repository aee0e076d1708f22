//! Role definitions and service descriptions
//!
//! A role is a workload a device may run: either a container image or an
//! in-process program looked up in a [`RoleRegistry`]. Definitions carry the
//! capabilities a device needs ([`Requirement`]) and the metric gates
//! ([`Metric`]) that decide when a lazy device should pick the role up.

pub mod kpi;
pub mod program;

use std::collections::BTreeSet;
use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::metrics::ThresholdType;

pub use kpi::KpiError;
pub use program::{Publisher, RoleContext, RoleProgram, RoleRegistry};

/// Hardware capabilities a device can advertise
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Hardware {
    Camera,
    Cpu,
    Sensor,
}

impl Hardware {
    fn tag(self) -> &'static str {
        match self {
            Hardware::Camera => "CAMERA",
            Hardware::Cpu => "CPU",
            Hardware::Sensor => "SENSOR",
        }
    }
}

/// A capability tag
///
/// Known hardware tags parse into [`Requirement::Hardware`]; any other tag is
/// kept verbatim and only compared for equality.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Requirement {
    Hardware(Hardware),
    Tag(String),
}

impl FromStr for Requirement {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let requirement = match s.trim().to_ascii_uppercase().as_str() {
            "CAMERA" => Requirement::Hardware(Hardware::Camera),
            "CPU" => Requirement::Hardware(Hardware::Cpu),
            "SENSOR" => Requirement::Hardware(Hardware::Sensor),
            _ => Requirement::Tag(s.trim().to_string()),
        };
        Ok(requirement)
    }
}

impl From<String> for Requirement {
    fn from(value: String) -> Self {
        match value.parse() {
            Ok(requirement) => requirement,
            Err(never) => match never {},
        }
    }
}

impl From<Requirement> for String {
    fn from(value: Requirement) -> Self {
        value.to_string()
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Requirement::Hardware(hardware) => f.write_str(hardware.tag()),
            Requirement::Tag(tag) => f.write_str(tag),
        }
    }
}

/// Unit of a gate's trailing window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeUnit {
    Seconds,
    Hours,
}

impl TimeUnit {
    pub fn symbol(self) -> &'static str {
        match self {
            TimeUnit::Seconds => "s",
            TimeUnit::Hours => "h",
        }
    }
}

/// Metric gate: `key` summed over the trailing window compared with `threshold`
///
/// Serialized in KPI notation, e.g. `"processing_time[1h] < 60"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Metric {
    pub key: String,
    pub threshold: f64,
    pub threshold_type: ThresholdType,
    pub amount: u64,
    pub unit: TimeUnit,
}

impl Metric {
    /// Length of the trailing window
    pub fn window(&self) -> Duration {
        let amount = i64::try_from(self.amount).unwrap_or(i64::MAX);
        match self.unit {
            TimeUnit::Seconds => Duration::try_seconds(amount),
            TimeUnit::Hours => Duration::try_hours(amount),
        }
        .unwrap_or(Duration::MAX)
    }

    /// Start of the window that ends at `now`
    pub fn since(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_sub_signed(self.window())
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

/// What a device launches for a role
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RolePayload {
    /// Container image reference, e.g. `registry.local/detector:1.2`
    Container { image: String },

    /// Name of a program in the device's [`RoleRegistry`]
    InProcess { executable: String },
}

/// Fleet-wide description of a role
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleDefinition {
    pub role_id: String,

    #[serde(default)]
    pub requirements: BTreeSet<Requirement>,

    /// Gates in the order given, duplicates removed
    #[serde(default, deserialize_with = "unique_metrics")]
    pub metrics: Vec<Metric>,

    pub payload: RolePayload,
}

impl RoleDefinition {
    /// Whether a device with `features` may run this role
    pub fn is_satisfied_by(&self, features: &BTreeSet<Requirement>) -> bool {
        self.requirements.is_subset(features)
    }

    pub fn is_gated(&self) -> bool {
        !self.metrics.is_empty()
    }
}

// `Metric` is neither `Ord` nor `Hash` (f64 threshold)
fn unique_metrics<'de, D>(deserializer: D) -> Result<Vec<Metric>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let mut unique = Vec::new();
    for metric in Vec::<Metric>::deserialize(deserializer)? {
        if !unique.contains(&metric) {
            unique.push(metric);
        }
    }
    Ok(unique)
}

/// A named group of roles, the unit of distribution from the platform
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceDescription {
    pub id: String,

    #[serde(default)]
    pub roles: Vec<RoleDefinition>,
}
