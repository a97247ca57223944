//! Run instrumentation: traces, metrics and log setup.
//!
//! Nothing in this crate is ambient. A [`Telemetry`] value is constructed
//! explicitly, shared behind an `Arc`, and handed to whatever needs to record
//! into it. Tests build their own instance or call [`Telemetry::reset`].
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use telemetry::Telemetry;
//!
//! let telemetry = Telemetry::new();
//! let id = telemetry.tracer.start_trace("run", Default::default());
//! telemetry
//!     .tracer
//!     .add_span(id, "classify", Duration::ZERO, Duration::from_millis(10))?;
//! let trace = telemetry.tracer.end_trace(id)?;
//! assert_eq!(trace.total_duration(), Duration::from_millis(10));
//!
//! telemetry.metrics.increment("runs", 1);
//! assert_eq!(telemetry.metrics.snapshot().counters["runs"], 1);
//! # Ok::<(), telemetry::Error>(())
//! ```

mod error;
pub mod logging;
mod metrics;
mod trace;

use chrono::{DateTime, Utc};
use serde::Serialize;

pub use error::{Error, Result};
pub use metrics::{HistogramSummary, Metrics, MetricsSnapshot, labelled};
pub use trace::{Span, SpanReport, Trace, TraceId, TraceReport, TraceStatus, Tracer};

/// Process-scoped instrumentation context.
#[derive(Debug, Default)]
pub struct Telemetry {
    pub tracer: Tracer,
    pub metrics: Metrics,
}

/// Serializable export of everything recorded so far.
#[derive(Debug, Clone, Serialize)]
pub struct TelemetrySnapshot {
    pub taken_at: DateTime<Utc>,
    pub traces: Vec<TraceReport>,
    pub metrics: MetricsSnapshot,
}

impl Telemetry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every trace and metric sample.
    pub fn reset(&self) {
        self.tracer.reset();
        self.metrics.reset();
    }

    /// Export finished traces and the current metrics.
    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            taken_at: Utc::now(),
            traces: self.tracer.completed().iter().map(Trace::report).collect(),
            metrics: self.metrics.snapshot(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn reset_clears_traces_and_metrics() {
        let telemetry = Telemetry::new();
        let id = telemetry.tracer.start_trace("op", Default::default());
        telemetry.tracer.end_trace(id).unwrap();
        telemetry.metrics.increment("calls", 3);

        telemetry.reset();

        let snapshot = telemetry.snapshot();
        assert!(snapshot.traces.is_empty());
        assert!(snapshot.metrics.counters.is_empty());
    }

    #[test]
    fn snapshot_serializes_stable_schema() {
        let telemetry = Telemetry::new();
        let id = telemetry.tracer.start_trace("run", Default::default());
        telemetry
            .tracer
            .add_span(id, "step", Duration::ZERO, Duration::from_millis(4))
            .unwrap();
        telemetry.tracer.end_trace(id).unwrap();
        telemetry.metrics.histogram_record("latency_ms", 4.0);

        let json = serde_json::to_value(telemetry.snapshot()).unwrap();
        let trace = &json["traces"][0];
        assert_eq!(trace["operation"], "run");
        assert_eq!(trace["total_duration_ms"], 4.0);
        assert_eq!(trace["spans"][0]["name"], "step");
        assert_eq!(json["metrics"]["histograms"]["latency_ms"]["count"], 1);
    }
}
