//! In-memory time series of numeric samples
//!
//! Samples are appended per key and never mutated. Queries aggregate every
//! sample whose key starts with a prefix, so per-source sub-keys such as
//! `processing_time_cam1` and `processing_time_cam2` can be read as one
//! logical metric `processing_time`.
//!
//! ## Concurrency
//!
//! The key index sits behind a read/write lock that is only taken for writing
//! when a new key shows up (or during retention pruning). Each series has its
//! own mutex, so writers on different keys never contend.

pub mod monitor;

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Bound;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

pub use monitor::{ThresholdMonitor, ThresholdType};

/// Result type alias for metric queries
pub type MetricsResult<T> = Result<T, MetricsError>;

/// A single recorded value
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

/// Aggregation applied over a window of samples
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Aggregation {
    /// Arithmetic sum, `0.0` for an empty window
    Sum,

    /// Arithmetic mean. An empty window yields `NaN`.
    Avg,

    /// Nearest-rank percentile, `p` in `(0, 100]`. An empty window is an error.
    Percentile(f64),
}

/// Errors returned by [`MetricsStore::aggregate`]
#[derive(Debug, Clone, PartialEq)]
pub enum MetricsError {
    /// A percentile was requested over a window without samples
    EmptyWindow { prefix: String },

    /// Percentile outside of `(0, 100]`
    InvalidPercentile(f64),

    /// Threshold type string that is neither `>=` nor `<`
    UnknownThresholdType(String),
}

impl fmt::Display for MetricsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricsError::EmptyWindow { prefix } => {
                write!(f, "no samples for '{prefix}' in the requested window")
            }
            MetricsError::InvalidPercentile(p) => {
                write!(f, "percentile must be in (0, 100], got {p}")
            }
            MetricsError::UnknownThresholdType(raw) => {
                write!(f, "unknown threshold type: {raw}")
            }
        }
    }
}

impl std::error::Error for MetricsError {}

type Series = Mutex<Vec<MetricSample>>;

/// Append-only metric store
#[derive(Debug, Default)]
pub struct MetricsStore {
    series: RwLock<BTreeMap<String, Series>>,
}

impl MetricsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a sample to `key`
    pub fn store(&self, key: &str, value: f64, timestamp: DateTime<Utc>) {
        let sample = MetricSample { value, timestamp };
        trace!(key, value, "storing metric sample");

        // the index read lock stays held during the push so pruning can't
        // orphan a series between lookup and append
        {
            let index = self.series.read();
            if let Some(series) = index.get(key) {
                series.lock().push(sample);
                return;
            }
        }

        let mut index = self.series.write();
        index
            .entry(key.to_string())
            .or_default()
            .lock()
            .push(sample);
    }

    /// Aggregate all samples for keys starting with `prefix` recorded strictly
    /// after `since`
    pub fn aggregate(
        &self,
        prefix: &str,
        since: DateTime<Utc>,
        op: Aggregation,
    ) -> MetricsResult<f64> {
        let values = self.window(prefix, since);

        match op {
            Aggregation::Sum => Ok(values.iter().sum()),
            Aggregation::Avg => Ok(values.iter().sum::<f64>() / values.len() as f64),
            Aggregation::Percentile(p) => percentile(values, p, prefix),
        }
    }

    /// Collect the raw values inside a window
    pub fn window(&self, prefix: &str, since: DateTime<Utc>) -> Vec<f64> {
        let index = self.series.read();
        index
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(key, _)| key.starts_with(prefix))
            .flat_map(|(_, series)| {
                series
                    .lock()
                    .iter()
                    .filter(|sample| sample.timestamp > since)
                    .map(|sample| sample.value)
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Drop every sample recorded before `cutoff`, returning how many went away
    pub fn prune_before(&self, cutoff: DateTime<Utc>) -> usize {
        let mut index = self.series.write();
        let mut removed = 0;

        index.retain(|_, series| {
            let mut samples = series.lock();
            let before = samples.len();
            samples.retain(|sample| sample.timestamp >= cutoff);
            removed += before - samples.len();
            !samples.is_empty()
        });

        debug!("pruned {removed} metric samples older than {cutoff}");
        removed
    }

    /// Known metric keys, in lexicographic order
    pub fn keys(&self) -> Vec<String> {
        self.series.read().keys().cloned().collect()
    }

    /// Number of distinct keys
    pub fn len(&self) -> usize {
        self.series.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.read().is_empty()
    }

    /// Total number of samples across all keys
    pub fn sample_count(&self) -> usize {
        self.series
            .read()
            .values()
            .map(|series| series.lock().len())
            .sum()
    }
}

fn percentile(mut values: Vec<f64>, p: f64, prefix: &str) -> MetricsResult<f64> {
    if !(p > 0.0 && p <= 100.0) {
        return Err(MetricsError::InvalidPercentile(p));
    }
    if values.is_empty() {
        return Err(MetricsError::EmptyWindow {
            prefix: prefix.to_string(),
        });
    }

    values.sort_by(f64::total_cmp);

    let rank = (p / 100.0 * values.len() as f64).ceil() as usize;
    let index = rank.clamp(1, values.len()) - 1;
    Ok(values[index])
}
