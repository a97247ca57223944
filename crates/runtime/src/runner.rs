//! Drives runs of the root agent against sessions.

use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use futures::channel::mpsc::{self, UnboundedSender};
use futures::stream::{self, BoxStream};
use futures::{Stream, StreamExt, future};
use serde_json::{Value, json};
use storage::{Event, MemoryBank, SessionHandle, SessionKey, SessionStore, RunLease};
use telemetry::{Telemetry, TraceId};

use crate::agent::{Agent, AgentInput, Context, EventSink, Invocation};
use crate::Result;

/// Counter: finished runs, successful or not.
pub const RUNS_TOTAL: &str = "runs.total";
/// Counter: runs that ended with an error event.
pub const RUNS_FAILED: &str = "runs.failed";
/// Counter: runs dropped before finishing.
pub const RUNS_CANCELLED: &str = "runs.cancelled";
/// Gauge: runs in flight.
pub const RUNS_ACTIVE: &str = "runs.active";
/// Histogram: wall time per run, in milliseconds.
pub const RUN_DURATION_MS: &str = "run.duration_ms";

/// Context key under which the compacted memory digest is passed to the root agent.
pub const HISTORICAL_CONTEXT: &str = "historical_context";

#[derive(Debug, Clone)]
struct MemorySettings {
    bank: Arc<MemoryBank>,
    token_budget: usize,
}

/// Runs one agent tree for one application.
#[derive(Debug)]
pub struct Runner {
    app: String,
    root: Arc<Agent>,
    sessions: Arc<SessionStore>,
    telemetry: Arc<Telemetry>,
    memory: Option<MemorySettings>,
    memory_focus: Option<Vec<String>>,
    include_suppressed: bool,
    active: Arc<AtomicUsize>,
}

impl Runner {
    /// Validates the agent tree up front.
    pub fn new(
        app: impl Into<String>,
        root: Agent,
        sessions: Arc<SessionStore>,
        telemetry: Arc<Telemetry>,
    ) -> Result<Self> {
        root.validate()?;
        Ok(Self {
            app: app.into(),
            root: Arc::new(root),
            sessions,
            telemetry,
            memory: None,
            memory_focus: None,
            include_suppressed: false,
            active: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Thread a compacted memory digest into every run and remember each result.
    pub fn with_memory(mut self, bank: Arc<MemoryBank>, token_budget: usize) -> Self {
        self.memory = Some(MemorySettings { bank, token_budget });
        self
    }

    /// Tags that make a remembered record more relevant to this runner's
    /// digest. Defaults to the app name and the root agent's name, the tags
    /// every run's own record carries.
    pub fn memory_focus(mut self, tags: Vec<String>) -> Self {
        self.memory_focus = Some(tags);
        self
    }

    /// Also stream events that non-root agents mark as suppressed.
    pub fn include_suppressed(mut self, include: bool) -> Self {
        self.include_suppressed = include;
        self
    }

    pub fn app(&self) -> &str {
        &self.app
    }

    pub fn root(&self) -> &Agent {
        &self.root
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    pub fn telemetry(&self) -> &Arc<Telemetry> {
        &self.telemetry
    }

    fn default_tags(&self) -> Vec<String> {
        vec![self.app.clone(), self.root.name().to_string()]
    }

    /// Start a run and return its events as a lazy stream.
    ///
    /// The session is created if needed and claimed immediately, so a second
    /// run on the same session fails with `SessionError::Busy` until this
    /// stream is finished or dropped. No work happens until the stream is
    /// polled. Dropping the stream early cancels the run.
    pub fn run(&self, user: &str, session: &str, message: impl Into<String>) -> Result<RunStream> {
        let handle = self
            .sessions
            .get_or_create(SessionKey::new(self.app.as_str(), user, session));
        let lease = self.sessions.begin_run(&handle)?;

        let (tx, rx) = mpsc::unbounded();
        let run = ActiveRun {
            app: self.app.clone(),
            root: Arc::clone(&self.root),
            telemetry: Arc::clone(&self.telemetry),
            memory: self.memory.clone(),
            focus_tags: self
                .memory_focus
                .clone()
                .unwrap_or_else(|| self.default_tags()),
            sink: RunSink {
                sessions: Arc::clone(&self.sessions),
                handle,
                tx,
                include_suppressed: self.include_suppressed,
            },
            active: Arc::clone(&self.active),
            trace: None,
            started: false,
            finished: false,
            _lease: lease,
        };

        let driver = stream::once(run.drive(message.into())).filter_map(|()| future::ready(None));
        Ok(RunStream {
            inner: stream::select(rx, driver).boxed(),
        })
    }
}

/// Events of one run, ending with its terminal event.
pub struct RunStream {
    inner: BoxStream<'static, Event>,
}

impl std::fmt::Debug for RunStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunStream").finish_non_exhaustive()
    }
}

impl Stream for RunStream {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Event>> {
        self.inner.poll_next_unpin(cx)
    }
}

/// Appends agent output to the session and forwards visible events.
struct RunSink {
    sessions: Arc<SessionStore>,
    handle: SessionHandle,
    tx: UnboundedSender<Event>,
    include_suppressed: bool,
}

impl RunSink {
    fn forward(&self, event: Event) {
        if event.visible || self.include_suppressed {
            // The receiver is gone only when the run is being cancelled.
            let _ = self.tx.unbounded_send(event);
        }
    }
}

impl EventSink for RunSink {
    fn publish(&self, slot: &str, value: &Value) -> Result<()> {
        self.sessions.set_state(&self.handle, slot, value.clone())?;
        Ok(())
    }

    fn emit(&self, event: Event) -> Result<()> {
        self.sessions.append_event(&self.handle, event.clone())?;
        self.forward(event);
        Ok(())
    }
}

/// State of one run. Dropping it before `finished` is set records a cancellation.
struct ActiveRun {
    app: String,
    root: Arc<Agent>,
    telemetry: Arc<Telemetry>,
    memory: Option<MemorySettings>,
    focus_tags: Vec<String>,
    sink: RunSink,
    active: Arc<AtomicUsize>,
    trace: Option<TraceId>,
    started: bool,
    finished: bool,
    _lease: RunLease,
}

impl ActiveRun {
    fn key(&self) -> &SessionKey {
        self.sink.handle.key()
    }

    async fn drive(mut self, message: String) {
        self.started = true;
        let active = self.active.fetch_add(1, Ordering::AcqRel) + 1;
        self.telemetry.metrics.gauge_set(RUNS_ACTIVE, active as f64);
        tracing::info!(session = %self.key(), agent = self.root.name(), "run started");

        let appended = self
            .sink
            .sessions
            .append_event(&self.sink.handle, Event::user(message.as_str()));

        let key = self.key().clone();
        let metadata = BTreeMap::from([
            ("app".to_string(), json!(self.app)),
            ("user".to_string(), json!(key.user)),
            ("session".to_string(), json!(key.session)),
            ("agent".to_string(), json!(self.root.name())),
        ]);
        let trace = self.telemetry.tracer.start_trace("run", metadata);
        self.trace = Some(trace);

        let outcome = match appended {
            Ok(()) => self.execute(&message, trace).await,
            Err(e) => Err(e.into()),
        };

        if let Err(e) = &outcome {
            tracing::error!(session = %key, trace_id = %trace, error = %e, "run failed");
            let event = Event::error(self.root.name(), e.to_string()).terminal();
            if let Err(append_err) = self.sink.emit(event.clone()) {
                tracing::warn!(session = %key, error = %append_err, "could not record failure event");
                self.sink.forward(event);
            }
        }

        let elapsed = self.close_trace(false);
        let metrics = &self.telemetry.metrics;
        metrics.increment(RUNS_TOTAL, 1);
        if outcome.is_err() {
            metrics.increment(RUNS_FAILED, 1);
        }
        metrics.histogram_record(RUN_DURATION_MS, elapsed.as_secs_f64() * 1000.0);
        self.finished = true;
        tracing::info!(
            session = %key,
            trace_id = %trace,
            ok = outcome.is_ok(),
            elapsed_ms = elapsed.as_millis() as u64,
            "run finished"
        );
    }

    async fn execute(&self, message: &str, trace: TraceId) -> Result<()> {
        let context = self.context()?;
        let cx = Invocation {
            sink: &self.sink,
            telemetry: &self.telemetry,
            trace: Some(trace),
        };
        let output = self
            .root
            .invoke(&cx, AgentInput::new(message).with_context(context), 0)
            .await?;
        self.remember(message, &output.value);
        Ok(())
    }

    /// Session state plus the memory digest, if any.
    fn context(&self) -> Result<Context> {
        let mut context = self.sink.sessions.state(&self.sink.handle)?;
        let Some(memory) = &self.memory else {
            return Ok(context);
        };
        let digest = memory.bank.compact_for(
            &self.key().user,
            memory.token_budget,
            &self.focus_tags,
            &[],
        );
        match digest {
            Ok(digest) if !digest.is_empty() => {
                tracing::debug!(
                    session = %self.key(),
                    records = digest.records.len(),
                    tokens = digest.tokens,
                    "threading memory digest"
                );
                context.insert(HISTORICAL_CONTEXT.to_string(), Value::String(digest.text));
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(session = %self.key(), error = %e, "memory compaction failed"),
        }
        Ok(context)
    }

    fn remember(&self, message: &str, output: &Value) {
        let Some(memory) = &self.memory else {
            return;
        };
        let key = self.key();
        let content = json!({
            "session": key.session,
            "message": message,
            "output": output,
        });
        let tags = [self.app.clone(), self.root.name().to_string()];
        if let Err(e) = memory
            .bank
            .add(&key.user, self.root.output_slot(), content, &tags)
        {
            tracing::warn!(session = %key, error = %e, "could not write run to memory");
        }
    }

    /// Record the run span and close the trace. Returns the run's duration.
    fn close_trace(&mut self, cancelled: bool) -> Duration {
        let Some(trace) = self.trace.take() else {
            return Duration::ZERO;
        };
        let tracer = &self.telemetry.tracer;
        let elapsed = tracer.elapsed(trace).unwrap_or_default();
        if let Err(e) = tracer.add_span(trace, "run", Duration::ZERO, elapsed) {
            tracing::debug!(trace_id = %trace, error = %e, "run span dropped");
        }
        let closed = if cancelled {
            tracer.abandon(trace)
        } else {
            tracer.end_trace(trace)
        };
        if let Err(e) = closed {
            tracing::warn!(trace_id = %trace, error = %e, "trace already closed");
        }
        elapsed
    }
}

impl Drop for ActiveRun {
    fn drop(&mut self) {
        if !self.started {
            return;
        }
        let active = self.active.fetch_sub(1, Ordering::AcqRel).saturating_sub(1);
        self.telemetry.metrics.gauge_set(RUNS_ACTIVE, active as f64);
        if self.finished {
            return;
        }

        let event = Event::error(self.root.name(), "run cancelled").terminal();
        if let Err(e) = self.sink.sessions.append_event(&self.sink.handle, event) {
            tracing::debug!(session = %self.key(), error = %e, "cancellation event not recorded");
        }
        self.close_trace(true);
        self.telemetry.metrics.increment(RUNS_CANCELLED, 1);
        tracing::warn!(session = %self.key(), "run cancelled");
    }
}
