//! Latency sampling per operation tag.
//!
//! Each tag keeps a rolling window of twice the configured sample size;
//! the oldest measurement is evicted first.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::TimingConfig;

/// Tag for register reads.
pub const OP_MODBUS_READ: &str = "modbus_read";

/// Tag for single-register writes.
pub const OP_MODBUS_WRITE: &str = "modbus_write";

/// One timed exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimingMeasurement {
    pub operation: String,
    pub duration: Duration,
    /// False when the device answered with an error.
    pub success: bool,
    pub timestamp: DateTime<Utc>,
}

/// Summary of one tag's window. Durations in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimingStats {
    pub operation: String,
    pub sample_count: usize,
    pub mean_ms: f64,
    pub median_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub success_rate: f64,
}

/// Percentile of pre-sorted `values` with linear interpolation between
/// neighbouring order statistics. Returns 0.0 for an empty slice.
pub fn percentile(sorted: &[f64], pct: f64) -> f64 {
    match sorted.len() {
        0 => 0.0,
        1 => sorted[0],
        len => {
            let rank = (pct.clamp(0.0, 100.0) / 100.0) * (len - 1) as f64;
            let lower = rank.floor() as usize;
            let upper = (lower + 1).min(len - 1);
            let fraction = rank - lower as f64;
            sorted[lower] + fraction * (sorted[upper] - sorted[lower])
        }
    }
}

/// Rolling latency windows keyed by operation tag.
#[derive(Debug, Clone)]
pub struct TimingCollector {
    sample_size: usize,
    enabled: bool,
    windows: HashMap<String, VecDeque<TimingMeasurement>>,
}

impl TimingCollector {
    pub fn new(config: &TimingConfig) -> Self {
        Self {
            sample_size: config.sample_size.max(1),
            enabled: config.enabled,
            windows: HashMap::new(),
        }
    }

    /// Retained measurements per tag.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.sample_size * 2
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Stop or resume recording; existing windows are kept.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn record(&mut self, operation: &str, duration: Duration, success: bool) {
        if !self.enabled {
            return;
        }
        let capacity = self.capacity();
        let window = self
            .windows
            .entry(operation.to_string())
            .or_insert_with(|| VecDeque::with_capacity(capacity));
        if window.len() == capacity {
            window.pop_front();
        }
        window.push_back(TimingMeasurement {
            operation: operation.to_string(),
            duration,
            success,
            timestamp: Utc::now(),
        });
        debug!(
            "Timing: {} {} in {:?} ({} samples)",
            operation,
            if success { "ok" } else { "failed" },
            duration,
            window.len()
        );
    }

    pub fn sample_count(&self, operation: &str) -> usize {
        self.windows.get(operation).map_or(0, VecDeque::len)
    }

    pub fn measurements(&self, operation: &str) -> impl Iterator<Item = &TimingMeasurement> {
        self.windows.get(operation).into_iter().flatten()
    }

    pub fn operations(&self) -> impl Iterator<Item = &str> {
        self.windows.keys().map(String::as_str)
    }

    /// Statistics for `operation`; `None` below two samples.
    pub fn stats(&self, operation: &str) -> Option<TimingStats> {
        let window = self.windows.get(operation)?;
        if window.len() < 2 {
            return None;
        }

        let mut durations = window
            .iter()
            .map(|m| m.duration.as_secs_f64() * 1000.0)
            .collect::<Vec<_>>();
        durations.sort_by(f64::total_cmp);

        let count = durations.len();
        let successes = window.iter().filter(|m| m.success).count();
        Some(TimingStats {
            operation: operation.to_string(),
            sample_count: count,
            mean_ms: durations.iter().sum::<f64>() / count as f64,
            median_ms: percentile(&durations, 50.0),
            p95_ms: percentile(&durations, 95.0),
            p99_ms: percentile(&durations, 99.0),
            min_ms: durations[0],
            max_ms: durations[count - 1],
            success_rate: successes as f64 / count as f64,
        })
    }

    pub fn all_stats(&self) -> Vec<TimingStats> {
        let mut stats = self
            .windows
            .keys()
            .filter_map(|op| self.stats(op))
            .collect::<Vec<_>>();
        stats.sort_by(|a, b| a.operation.cmp(&b.operation));
        stats
    }

    /// Drop one tag's window, or every window with `None`.
    pub fn clear(&mut self, operation: Option<&str>) {
        match operation {
            Some(op) => {
                self.windows.remove(op);
            }
            None => self.windows.clear(),
        }
    }
}

impl Default for TimingCollector {
    fn default() -> Self {
        Self::new(&TimingConfig::default())
    }
}
