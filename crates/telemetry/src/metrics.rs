//! Counters, gauges and histograms keyed by name.
//!
//! A metric may carry labels. Labelled samples are stored under
//! `name{k1=v1,k2=v2}` with labels sorted by key, so the same label set
//! always lands on the same series.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Default)]
struct Registry {
    counters: BTreeMap<String, u64>,
    gauges: BTreeMap<String, f64>,
    histograms: BTreeMap<String, Vec<f64>>,
}

/// Thread-safe metrics registry.
#[derive(Debug, Default)]
pub struct Metrics {
    registry: Mutex<Registry>,
}

/// Point-in-time view of every metric.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub taken_at: DateTime<Utc>,
    pub counters: BTreeMap<String, u64>,
    pub gauges: BTreeMap<String, f64>,
    pub histograms: BTreeMap<String, HistogramSummary>,
}

/// Derived statistics for one histogram. Percentiles use nearest rank.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HistogramSummary {
    pub count: usize,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub p50: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
}

impl HistogramSummary {
    fn from_samples(samples: &[f64]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        let mut sorted = samples.to_vec();
        sorted.sort_by(f64::total_cmp);

        let count = sorted.len();
        let sum: f64 = sorted.iter().sum();
        Some(Self {
            count,
            sum,
            min: sorted[0],
            max: sorted[count - 1],
            mean: sum / count as f64,
            p50: percentile(&sorted, 0.50),
            p90: percentile(&sorted, 0.90),
            p95: percentile(&sorted, 0.95),
            p99: percentile(&sorted, 0.99),
        })
    }
}

fn percentile(sorted: &[f64], q: f64) -> f64 {
    let n = sorted.len();
    let idx = ((q * n as f64).ceil() as usize).saturating_sub(1).min(n - 1);
    sorted[idx]
}

/// Series key for `name` with `labels`. No labels gives the bare name.
pub fn labelled(name: &str, labels: &[(&str, &str)]) -> String {
    if labels.is_empty() {
        return name.to_string();
    }
    let mut sorted = labels.to_vec();
    sorted.sort();
    let rendered: Vec<String> = sorted.iter().map(|(k, v)| format!("{k}={v}")).collect();
    format!("{name}{{{}}}", rendered.join(","))
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add `amount` to a monotonic counter.
    pub fn increment(&self, name: &str, amount: u64) {
        let mut registry = self.lock();
        let counter = registry.counters.entry(name.to_string()).or_default();
        *counter = counter.saturating_add(amount);
    }

    /// Add `amount` to the counter series for `labels`.
    pub fn increment_with(&self, name: &str, labels: &[(&str, &str)], amount: u64) {
        self.increment(&labelled(name, labels), amount);
    }

    /// Current value of a counter (zero if never incremented).
    pub fn counter(&self, name: &str) -> u64 {
        self.lock().counters.get(name).copied().unwrap_or(0)
    }

    pub fn counter_with(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        self.counter(&labelled(name, labels))
    }

    /// Overwrite a gauge.
    pub fn gauge_set(&self, name: &str, value: f64) {
        self.lock().gauges.insert(name.to_string(), value);
    }

    /// Observe one histogram value. Non-finite values are dropped.
    pub fn histogram_record(&self, name: &str, value: f64) {
        if !value.is_finite() {
            tracing::debug!(metric = name, value, "dropping non-finite histogram sample");
            return;
        }
        self.lock()
            .histograms
            .entry(name.to_string())
            .or_default()
            .push(value);
    }

    pub fn histogram_record_with(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        self.histogram_record(&labelled(name, labels), value);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let registry = self.lock();
        MetricsSnapshot {
            taken_at: Utc::now(),
            counters: registry.counters.clone(),
            gauges: registry.gauges.clone(),
            histograms: registry
                .histograms
                .iter()
                .filter_map(|(name, samples)| {
                    HistogramSummary::from_samples(samples).map(|s| (name.clone(), s))
                })
                .collect(),
        }
    }

    pub fn reset(&self) {
        let mut registry = self.lock();
        registry.counters.clear();
        registry.gauges.clear();
        registry.histograms.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn counters_accumulate() {
        let metrics = Metrics::new();
        metrics.increment("runs", 1);
        metrics.increment("runs", 2);
        assert_eq!(metrics.counter("runs"), 3);
        assert_eq!(metrics.counter("missing"), 0);
    }

    #[test]
    fn gauge_keeps_latest_value() {
        let metrics = Metrics::new();
        metrics.gauge_set("active", 4.0);
        metrics.gauge_set("active", 1.0);
        assert_eq!(metrics.snapshot().gauges["active"], 1.0);
    }

    #[test]
    fn histogram_percentiles() {
        let metrics = Metrics::new();
        for v in 1..=100 {
            metrics.histogram_record("latency", v as f64);
        }
        let summary = metrics.snapshot().histograms["latency"];
        assert_eq!(summary.count, 100);
        assert_eq!(summary.min, 1.0);
        assert_eq!(summary.max, 100.0);
        assert_eq!(summary.p50, 50.0);
        assert_eq!(summary.p95, 95.0);
        assert_eq!(summary.p99, 99.0);
        assert!((summary.mean - 50.5).abs() < f64::EPSILON);
    }

    #[test]
    fn single_sample_histogram() {
        let metrics = Metrics::new();
        metrics.histogram_record("latency", 7.5);
        metrics.histogram_record("latency", f64::NAN);
        let summary = metrics.snapshot().histograms["latency"];
        assert_eq!(summary.count, 1);
        assert_eq!(summary.p50, 7.5);
        assert_eq!(summary.p99, 7.5);
    }

    #[test]
    fn labels_are_sorted_into_one_series() {
        let metrics = Metrics::new();
        metrics.increment_with("tool.calls", &[("tool", "read_document"), ("agent", "classifier")], 1);
        metrics.increment_with("tool.calls", &[("agent", "classifier"), ("tool", "read_document")], 2);
        metrics.increment_with("tool.calls", &[("agent", "analyst"), ("tool", "read_document")], 1);

        let key = "tool.calls{agent=classifier,tool=read_document}";
        assert_eq!(labelled("tool.calls", &[("tool", "read_document"), ("agent", "classifier")]), key);
        assert_eq!(metrics.counter(key), 3);
        assert_eq!(metrics.counter_with("tool.calls", &[("agent", "analyst"), ("tool", "read_document")]), 1);
        assert_eq!(metrics.counter("tool.calls"), 0);
        assert_eq!(labelled("runs", &[]), "runs");
    }

    #[test]
    fn labelled_histograms_are_separate() {
        let metrics = Metrics::new();
        metrics.histogram_record_with("model.latency_ms", &[("agent", "a")], 10.0);
        metrics.histogram_record_with("model.latency_ms", &[("agent", "b")], 30.0);
        let histograms = metrics.snapshot().histograms;
        assert_eq!(histograms["model.latency_ms{agent=a}"].max, 10.0);
        assert_eq!(histograms["model.latency_ms{agent=b}"].max, 30.0);
    }

    #[test]
    fn concurrent_increments_are_not_lost() {
        let metrics = Arc::new(Metrics::new());
        std::thread::scope(|scope| {
            for _ in 0..8 {
                let metrics = Arc::clone(&metrics);
                scope.spawn(move || {
                    for _ in 0..1000 {
                        metrics.increment("hits", 1);
                    }
                });
            }
        });
        assert_eq!(metrics.counter("hits"), 8000);
    }

    #[test]
    fn reset_clears_everything() {
        let metrics = Metrics::new();
        metrics.increment("a", 1);
        metrics.gauge_set("b", 1.0);
        metrics.histogram_record("c", 1.0);
        metrics.reset();

        let snapshot = metrics.snapshot();
        assert!(snapshot.counters.is_empty());
        assert!(snapshot.gauges.is_empty());
        assert!(snapshot.histograms.is_empty());
    }
}
