//! KPI notation for metric gates
//!
//! ```text
//! <metricKey>[<amount><unit>] <op> <threshold>
//! processing_time[1h] < 60
//! throughput[100s] >= 100
//! ```
//!
//! Units are `s` (seconds) and `h` (hours); operators are `<` and `>=`.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;

use super::{Metric, TimeUnit};
use crate::metrics::ThresholdType;

static KPI: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(.*?)\s*\[(.*)\]\s*(<|>=)\s*(.*?)\s*$").expect("KPI pattern is valid")
});

static WINDOW: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(\d+)\s*(\D+?)\s*$").expect("window pattern is valid"));

/// Errors raised while reading a KPI string
#[derive(Debug, Clone, PartialEq)]
pub enum KpiError {
    /// The string does not have the `key[window] op threshold` shape
    Malformed(String),

    /// Window is not `<digits><unit>`
    InvalidWindow(String),

    /// Window unit other than `s` or `h`
    UnknownUnit(String),

    /// Threshold is not a number
    InvalidThreshold(String),
}

impl fmt::Display for KpiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KpiError::Malformed(kpi) => write!(f, "malformed KPI '{kpi}'"),
            KpiError::InvalidWindow(window) => write!(f, "invalid KPI window '{window}'"),
            KpiError::UnknownUnit(unit) => write!(f, "unknown KPI time unit '{unit}'"),
            KpiError::InvalidThreshold(threshold) => {
                write!(f, "invalid KPI threshold '{threshold}'")
            }
        }
    }
}

impl std::error::Error for KpiError {}

impl FromStr for TimeUnit {
    type Err = KpiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "s" => Ok(TimeUnit::Seconds),
            "h" => Ok(TimeUnit::Hours),
            other => Err(KpiError::UnknownUnit(other.to_string())),
        }
    }
}

impl FromStr for Metric {
    type Err = KpiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let captures = KPI
            .captures(s)
            .ok_or_else(|| KpiError::Malformed(s.to_string()))?;

        let key = &captures[1];
        if key.is_empty() {
            return Err(KpiError::Malformed(s.to_string()));
        }

        let window = &captures[2];
        let window_parts = WINDOW
            .captures(window)
            .ok_or_else(|| KpiError::InvalidWindow(window.to_string()))?;
        let amount = window_parts[1]
            .parse()
            .map_err(|_| KpiError::InvalidWindow(window.to_string()))?;
        let unit = window_parts[2].parse()?;

        // the regex only admits the two known operators
        let threshold_type = match &captures[3] {
            ">=" => ThresholdType::GreaterThanOrEqualTo,
            _ => ThresholdType::LessThan,
        };

        let threshold = &captures[4];
        let threshold = threshold
            .parse()
            .map_err(|_| KpiError::InvalidThreshold(threshold.to_string()))?;

        Ok(Metric {
            key: key.to_string(),
            threshold,
            threshold_type,
            amount,
            unit,
        })
    }
}

impl TryFrom<String> for Metric {
    type Error = KpiError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Metric> for String {
    fn from(metric: Metric) -> Self {
        metric.to_string()
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[{}{}] {} {}",
            self.key,
            self.amount,
            self.unit.symbol(),
            self.threshold_type.symbol(),
            self.threshold
        )
    }
}
