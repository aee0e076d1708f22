//! Threshold checks over a metric window

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::trace;

use super::{MetricsError, MetricsStore};

/// Comparison applied between a window sum and a threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ThresholdType {
    GreaterThanOrEqualTo,
    LessThan,
}

impl ThresholdType {
    /// Compare an aggregated value against `threshold`.
    ///
    /// `LessThan` compares with `<=`. Existing service descriptions rely on
    /// this (a lazily started role idling at exactly the threshold counts as
    /// satisfied), so it must stay inclusive.
    pub fn is_met(self, value: f64, threshold: f64) -> bool {
        match self {
            ThresholdType::GreaterThanOrEqualTo => value >= threshold,
            ThresholdType::LessThan => value <= threshold,
        }
    }

    /// Operator symbol used in the KPI notation
    pub fn symbol(self) -> &'static str {
        match self {
            ThresholdType::GreaterThanOrEqualTo => ">=",
            ThresholdType::LessThan => "<",
        }
    }
}

impl fmt::Display for ThresholdType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThresholdType::GreaterThanOrEqualTo => write!(f, "GREATER_THAN_OR_EQUAL_TO"),
            ThresholdType::LessThan => write!(f, "LESS_THAN"),
        }
    }
}

impl FromStr for ThresholdType {
    type Err = MetricsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            ">=" | "GREATER_THAN_OR_EQUAL_TO" => Ok(ThresholdType::GreaterThanOrEqualTo),
            "<" | "LESS_THAN" => Ok(ThresholdType::LessThan),
            other => Err(MetricsError::UnknownThresholdType(other.to_string())),
        }
    }
}

/// Evaluates metric gates against a [`MetricsStore`]
#[derive(Debug, Clone)]
pub struct ThresholdMonitor {
    store: Arc<MetricsStore>,
}

impl ThresholdMonitor {
    pub fn new(store: Arc<MetricsStore>) -> Self {
        Self { store }
    }

    /// Whether the sum of `key` since `since` satisfies the threshold
    pub fn metric_is_met(
        &self,
        key: &str,
        threshold: f64,
        threshold_type: ThresholdType,
        since: DateTime<Utc>,
    ) -> bool {
        let sum = self.store.window(key, since).iter().sum::<f64>();
        let met = threshold_type.is_met(sum, threshold);
        trace!(key, sum, threshold, %threshold_type, met, "evaluated metric gate");
        met
    }

    pub fn store(&self) -> &Arc<MetricsStore> {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use pretty_assertions::assert_eq;

    fn monitor_with(key: &str, values: &[f64]) -> ThresholdMonitor {
        let store = Arc::new(MetricsStore::new());
        let now = Utc::now();
        for value in values {
            store.store(key, *value, now);
        }
        ThresholdMonitor::new(store)
    }

    fn recent() -> DateTime<Utc> {
        Utc::now() - Duration::seconds(100)
    }

    #[test]
    fn test_greater_than_or_equal() {
        let monitor = monitor_with("throughput", &[60.0, 40.0]);

        assert!(monitor.metric_is_met(
            "throughput",
            100.0,
            ThresholdType::GreaterThanOrEqualTo,
            recent()
        ));
        assert!(!monitor.metric_is_met(
            "throughput",
            100.5,
            ThresholdType::GreaterThanOrEqualTo,
            recent()
        ));
    }

    #[test]
    fn test_less_than_is_inclusive_on_purpose() {
        // LESS_THAN has always compared with <=; eviction decisions depend on it
        let monitor = monitor_with("latency", &[5.0, 5.0]);

        assert!(monitor.metric_is_met("latency", 10.0, ThresholdType::LessThan, recent()));
        assert!(!monitor.metric_is_met("latency", 9.9, ThresholdType::LessThan, recent()));
    }

    #[test]
    fn test_absent_data_reads_as_no_violation() {
        let monitor = monitor_with("other", &[1.0]);

        assert!(monitor.metric_is_met(
            "missing",
            0.0,
            ThresholdType::GreaterThanOrEqualTo,
            recent()
        ));
        assert!(monitor.metric_is_met("missing", 0.0, ThresholdType::LessThan, recent()));
        assert!(monitor.metric_is_met("missing", 42.0, ThresholdType::LessThan, recent()));
    }

    #[test]
    fn test_threshold_type_parsing() {
        assert_eq!(">=".parse::<ThresholdType>(), Ok(ThresholdType::GreaterThanOrEqualTo));
        assert_eq!("LESS_THAN".parse::<ThresholdType>(), Ok(ThresholdType::LessThan));
        assert_eq!(
            "<=".parse::<ThresholdType>(),
            Err(MetricsError::UnknownThresholdType("<=".to_string()))
        );
    }

    #[test]
    fn test_threshold_type_serde_names() {
        let json = serde_json::to_string(&ThresholdType::GreaterThanOrEqualTo).unwrap();
        assert_eq!(json, "\"GREATER_THAN_OR_EQUAL_TO\"");

        let parsed: Result<ThresholdType, _> = serde_json::from_str("\"GREATER_THAN\"");
        assert!(parsed.is_err());
    }
}
