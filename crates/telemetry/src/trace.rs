//! Traces: one per top-level operation, holding ordered spans.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::{Error, Result};

/// Finished traces retained for inspection.
const COMPLETED_CAPACITY: usize = 256;

/// A unique identifier for a trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TraceId(pub Uuid);

impl TraceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TraceId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TraceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One timed sub-operation. Offsets are relative to the trace origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Span {
    pub name: String,
    pub start: Duration,
    pub end: Duration,
}

impl Span {
    pub fn duration(&self) -> Duration {
        self.end.saturating_sub(self.start)
    }
}

/// Whether a trace ran to completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceStatus {
    Complete,
    /// Ended early, e.g. because the run was cancelled.
    Incomplete,
}

/// A finished trace.
#[derive(Debug, Clone)]
pub struct Trace {
    pub id: TraceId,
    pub operation: String,
    pub started_at: DateTime<Utc>,
    pub metadata: BTreeMap<String, Value>,
    pub spans: Vec<Span>,
    pub status: TraceStatus,
}

impl Trace {
    /// Last span end minus first span start; zero when no spans were recorded.
    pub fn total_duration(&self) -> Duration {
        let first = self.spans.iter().map(|s| s.start).min();
        let last = self.spans.iter().map(|s| s.end).max();
        match (first, last) {
            (Some(first), Some(last)) => last.saturating_sub(first),
            _ => Duration::ZERO,
        }
    }

    /// Export form with a stable, documented schema.
    pub fn report(&self) -> TraceReport {
        TraceReport {
            trace_id: self.id,
            operation: self.operation.clone(),
            started_at: self.started_at,
            status: self.status,
            total_duration_ms: millis(self.total_duration()),
            metadata: self.metadata.clone(),
            spans: self
                .spans
                .iter()
                .map(|span| SpanReport {
                    name: span.name.clone(),
                    start_ms: millis(span.start),
                    duration_ms: millis(span.duration()),
                })
                .collect(),
        }
    }
}

/// Serialized trace: `{trace_id, operation, status, total_duration_ms, spans[]}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceReport {
    pub trace_id: TraceId,
    pub operation: String,
    pub started_at: DateTime<Utc>,
    pub status: TraceStatus,
    pub total_duration_ms: f64,
    pub metadata: BTreeMap<String, Value>,
    pub spans: Vec<SpanReport>,
}

/// Serialized span: `{name, start_ms, duration_ms}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpanReport {
    pub name: String,
    pub start_ms: f64,
    pub duration_ms: f64,
}

fn millis(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

#[derive(Debug)]
struct ActiveTrace {
    trace: Trace,
    origin: Instant,
}

#[derive(Debug, Default)]
struct TracerState {
    active: HashMap<TraceId, ActiveTrace>,
    completed: VecDeque<Trace>,
}

/// Thread-safe trace registry.
#[derive(Debug, Default)]
pub struct Tracer {
    state: Mutex<TracerState>,
}

impl Tracer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, TracerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start a new trace and return its id.
    pub fn start_trace(
        &self,
        operation: impl Into<String>,
        metadata: BTreeMap<String, Value>,
    ) -> TraceId {
        let id = TraceId::new();
        let trace = Trace {
            id,
            operation: operation.into(),
            started_at: Utc::now(),
            metadata,
            spans: Vec::new(),
            status: TraceStatus::Complete,
        };
        tracing::debug!(trace_id = %id, operation = %trace.operation, "trace started");
        self.lock().active.insert(
            id,
            ActiveTrace {
                trace,
                origin: Instant::now(),
            },
        );
        id
    }

    /// Time since the trace started, for stamping span boundaries.
    pub fn elapsed(&self, id: TraceId) -> Result<Duration> {
        self.lock()
            .active
            .get(&id)
            .map(|active| active.origin.elapsed())
            .ok_or(Error::UnknownTrace(id))
    }

    /// Record a span on an open trace.
    pub fn add_span(
        &self,
        id: TraceId,
        name: impl Into<String>,
        start: Duration,
        end: Duration,
    ) -> Result<()> {
        let name = name.into();
        if end < start {
            return Err(Error::InvalidSpan { name });
        }
        let mut state = self.lock();
        let active = state.active.get_mut(&id).ok_or(Error::UnknownTrace(id))?;
        active.trace.spans.push(Span { name, start, end });
        Ok(())
    }

    /// Close a trace and return it.
    pub fn end_trace(&self, id: TraceId) -> Result<Trace> {
        self.finish(id, TraceStatus::Complete)
    }

    /// Close a trace that did not run to completion.
    pub fn abandon(&self, id: TraceId) -> Result<Trace> {
        self.finish(id, TraceStatus::Incomplete)
    }

    fn finish(&self, id: TraceId, status: TraceStatus) -> Result<Trace> {
        let mut state = self.lock();
        let active = state.active.remove(&id).ok_or(Error::UnknownTrace(id))?;
        let mut trace = active.trace;
        trace.status = status;

        if state.completed.len() == COMPLETED_CAPACITY {
            state.completed.pop_front();
        }
        state.completed.push_back(trace.clone());

        tracing::debug!(
            trace_id = %id,
            status = ?status,
            spans = trace.spans.len(),
            "trace ended"
        );
        Ok(trace)
    }

    /// Look up a finished trace.
    pub fn get(&self, id: TraceId) -> Option<Trace> {
        self.lock().completed.iter().find(|t| t.id == id).cloned()
    }

    /// Finished traces, oldest first.
    pub fn completed(&self) -> Vec<Trace> {
        self.lock().completed.iter().cloned().collect()
    }

    /// Number of traces still open.
    pub fn active_count(&self) -> usize {
        self.lock().active.len()
    }

    pub fn reset(&self) {
        let mut state = self.lock();
        state.active.clear();
        state.completed.clear();
    }
}
