//! # Timeout Learner
//!
//! Turns latency windows into timeout recommendations:
//!
//! ```text
//! timeout = clamp(P95 * safety_factor, min_timeout, max_timeout)
//! ```
//!
//! No recommendation is made below `min_samples`; the caller keeps its
//! static default. Timeouts restored from a previous run stand in until the
//! collector has enough fresh samples of its own.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::TimingConfig;
use crate::timing::TimingCollector;

/// A timeout recommendation for one operation tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearnedTimeout {
    pub operation: String,
    pub timeout_ms: u64,
    pub samples: usize,
    pub p95_ms: f64,
    /// Static timeout the recommendation replaces.
    pub default_ms: u64,
}

impl LearnedTimeout {
    #[inline]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Relative change against the static default, in percent.
    pub fn change_percent(&self) -> f64 {
        if self.default_ms == 0 {
            return 0.0;
        }
        (self.timeout_ms as f64 - self.default_ms as f64) / self.default_ms as f64 * 100.0
    }
}

/// Percentile-based timeout recommendations.
#[derive(Debug, Clone)]
pub struct TimeoutLearner {
    config: TimingConfig,
    defaults: BTreeMap<String, Duration>,
    restored: BTreeMap<String, LearnedTimeout>,
}

impl TimeoutLearner {
    pub fn new(config: TimingConfig) -> Self {
        Self {
            config,
            defaults: BTreeMap::new(),
            restored: BTreeMap::new(),
        }
    }

    /// Register the static timeout of `operation`.
    pub fn with_default(mut self, operation: impl Into<String>, timeout: Duration) -> Self {
        self.defaults.insert(operation.into(), timeout);
        self
    }

    pub fn default_for(&self, operation: &str) -> Duration {
        self.defaults
            .get(operation)
            .copied()
            .unwrap_or(Duration::from_secs(1))
    }

    fn clamp(&self, timeout: Duration) -> Duration {
        timeout.clamp(self.config.min_timeout, self.config.max_timeout)
    }

    /// Install persisted recommendations, clamped to the current bounds.
    pub fn restore(&mut self, learned: impl IntoIterator<Item = LearnedTimeout>) {
        for mut entry in learned {
            let clamped = self.clamp(entry.timeout());
            entry.timeout_ms = clamped.as_millis() as u64;
            debug!(
                "Restored timeout for {}: {}ms ({} samples)",
                entry.operation, entry.timeout_ms, entry.samples
            );
            self.restored.insert(entry.operation.clone(), entry);
        }
    }

    pub fn restored(&self) -> impl Iterator<Item = &LearnedTimeout> {
        self.restored.values()
    }

    /// Recommendation computed from fresh samples only.
    pub fn calculate(&self, collector: &TimingCollector, operation: &str) -> Option<LearnedTimeout> {
        let stats = collector.stats(operation)?;
        if stats.sample_count < self.config.min_samples {
            debug!(
                "Insufficient samples for {}: {} < {}",
                operation, stats.sample_count, self.config.min_samples
            );
            return None;
        }

        let raw_us = (stats.p95_ms * self.config.safety_factor * 1000.0).round();
        let raw = Duration::from_micros(raw_us.max(0.0) as u64);
        let timeout = self.clamp(raw);
        Some(LearnedTimeout {
            operation: operation.to_string(),
            timeout_ms: timeout.as_millis() as u64,
            samples: stats.sample_count,
            p95_ms: stats.p95_ms,
            default_ms: self.default_for(operation).as_millis() as u64,
        })
    }

    /// Fresh recommendation, falling back to a restored one.
    pub fn recommend(&self, collector: &TimingCollector, operation: &str) -> Option<LearnedTimeout> {
        self.calculate(collector, operation)
            .or_else(|| self.restored.get(operation).cloned())
    }

    /// Timeout to use for the next exchange of `operation`.
    pub fn timeout_for(&self, collector: &TimingCollector, operation: &str) -> Duration {
        self.recommend(collector, operation)
            .map(|learned| learned.timeout())
            .unwrap_or_else(|| self.default_for(operation))
    }

    /// Recommendations for every tag that has one, fresh or restored.
    pub fn all(&self, collector: &TimingCollector) -> Vec<LearnedTimeout> {
        let mut result = self
            .restored
            .values()
            .cloned()
            .map(|entry| (entry.operation.clone(), entry))
            .collect::<BTreeMap<_, _>>();
        for operation in collector.operations() {
            if let Some(learned) = self.calculate(collector, operation) {
                result.insert(learned.operation.clone(), learned);
            }
        }
        result.into_values().collect()
    }

    /// Human-readable summary of all recommendations.
    pub fn summary(&self, collector: &TimingCollector) -> String {
        let all = self.all(collector);
        if all.is_empty() {
            return "No learned timeouts available".to_string();
        }
        let mut lines = vec!["Timeout learning summary:".to_string()];
        for learned in &all {
            lines.push(format!(
                "- {}: {}ms (default {}ms, {:+.1}%), {} samples, P95 {:.1}ms",
                learned.operation,
                learned.timeout_ms,
                learned.default_ms,
                learned.change_percent(),
                learned.samples,
                learned.p95_ms
            ));
        }
        info!("{} learned timeouts", all.len());
        lines.join("\n")
    }
}

impl Default for TimeoutLearner {
    fn default() -> Self {
        Self::new(TimingConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timing::OP_MODBUS_READ;

    fn collector_with(samples: &[u64]) -> TimingCollector {
        let mut collector = TimingCollector::default();
        for &ms in samples {
            collector.record(OP_MODBUS_READ, Duration::from_millis(ms), true);
        }
        collector
    }

    fn learner() -> TimeoutLearner {
        TimeoutLearner::default().with_default(OP_MODBUS_READ, Duration::from_millis(1500))
    }

    #[test]
    fn test_no_recommendation_below_min_samples() {
        let collector = collector_with(&[400; 19]);
        assert!(learner().calculate(&collector, OP_MODBUS_READ).is_none());
        assert_eq!(
            learner().timeout_for(&collector, OP_MODBUS_READ),
            Duration::from_millis(1500)
        );
    }

    #[test]
    fn test_p95_times_safety_factor() {
        let collector = collector_with(&[400; 20]);
        let learned = learner().calculate(&collector, OP_MODBUS_READ).unwrap();
        assert_eq!(learned.timeout_ms, 600);
        assert_eq!(learned.samples, 20);
        assert_eq!(learned.default_ms, 1500);
        assert!(learned.change_percent() < 0.0);
    }

    #[test]
    fn test_clamped_to_bounds() {
        let fast = collector_with(&[10; 30]);
        assert_eq!(
            learner().timeout_for(&fast, OP_MODBUS_READ),
            Duration::from_millis(300)
        );

        let slow = collector_with(&[9000; 30]);
        assert_eq!(
            learner().timeout_for(&slow, OP_MODBUS_READ),
            Duration::from_secs(5)
        );
    }

    #[test]
    fn test_query_is_idempotent() {
        let collector = collector_with(&[350, 420, 380, 510, 460, 390, 410, 400, 430, 370,
            440, 360, 450, 480, 395, 405, 415, 425, 435, 445]);
        let learner = learner();
        let first = learner.calculate(&collector, OP_MODBUS_READ);
        let second = learner.calculate(&collector, OP_MODBUS_READ);
        assert!(first.is_some());
        assert_eq!(first, second);
    }

    #[test]
    fn test_restored_until_fresh_samples() {
        let mut learner = learner();
        learner.restore([LearnedTimeout {
            operation: OP_MODBUS_READ.to_string(),
            timeout_ms: 800,
            samples: 50,
            p95_ms: 533.0,
            default_ms: 1500,
        }]);

        let sparse = collector_with(&[200; 5]);
        assert_eq!(
            learner.timeout_for(&sparse, OP_MODBUS_READ),
            Duration::from_millis(800)
        );

        let rich = collector_with(&[200; 20]);
        assert_eq!(
            learner.timeout_for(&rich, OP_MODBUS_READ),
            Duration::from_millis(300)
        );
    }

    #[test]
    fn test_restored_values_are_clamped() {
        let mut learner = learner();
        learner.restore([LearnedTimeout {
            operation: OP_MODBUS_READ.to_string(),
            timeout_ms: 60_000,
            samples: 20,
            p95_ms: 40_000.0,
            default_ms: 1500,
        }]);
        let collector = TimingCollector::default();
        assert_eq!(
            learner.timeout_for(&collector, OP_MODBUS_READ),
            Duration::from_secs(5)
        );
        assert_eq!(learner.all(&collector).len(), 1);
        assert!(learner.summary(&collector).contains(OP_MODBUS_READ));
    }
}
