//! Agents and the delegation protocol.
//!
//! An [`Agent`] is either a [`LeafAgent`], which calls a model and possibly
//! one round of tools, or a [`CompositeAgent`], which runs its children in
//! declared order and threads each child's output into the next child's
//! context. Agent trees are built once and shared read-only across runs.
//!
//! Results reach the outside world only through an [`EventSink`]: on success
//! every agent publishes its value under its output slot and emits one event.
//! The root agent's event is terminal; everyone else's is suppressed.

mod composite;
mod leaf;

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;
use storage::Event;
use telemetry::{Telemetry, TraceId};

use crate::{Error, Result};

pub use composite::CompositeAgent;
pub use leaf::{LeafAgent, LeafAgentBuilder, MAX_TOOL_ROUNDS};

/// Key/value context handed to an agent, keyed by output slot.
pub type Context = BTreeMap<String, Value>;

/// Per-invocation lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Pending,
    Running,
    Succeeded,
    Failed,
}

/// What an agent is asked to work on.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentInput {
    pub message: String,
    pub context: Context,
}

impl AgentInput {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            context: Context::new(),
        }
    }

    pub fn with_context(mut self, context: Context) -> Self {
        self.context = context;
        self
    }
}

/// What an agent produced.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentOutput {
    pub value: Value,
    /// Every slot written during the invocation, in write order.
    pub slots: Vec<(String, Value)>,
}

/// Receives agent results as they are produced.
pub trait EventSink: Send + Sync {
    /// Write `value` to session state under `slot`.
    fn publish(&self, slot: &str, value: &Value) -> Result<()>;

    /// Append an event to the session log.
    fn emit(&self, event: Event) -> Result<()>;
}

/// Everything an agent needs from its caller for one invocation.
pub struct Invocation<'a> {
    pub sink: &'a dyn EventSink,
    pub telemetry: &'a Telemetry,
    pub trace: Option<TraceId>,
}

impl Invocation<'_> {
    /// Offset into the current trace, if one is open.
    pub(crate) fn now(&self) -> Option<Duration> {
        self.trace
            .and_then(|id| self.telemetry.tracer.elapsed(id).ok())
    }

    /// Record a span from `start` until now.
    pub(crate) fn span(&self, name: impl Into<String>, start: Option<Duration>) {
        let (Some(id), Some(start), Some(end)) = (self.trace, start, self.now()) else {
            return;
        };
        if let Err(e) = self.telemetry.tracer.add_span(id, name, start, end) {
            tracing::debug!(trace_id = %id, error = %e, "span dropped");
        }
    }
}

/// A node in the agent tree.
#[derive(Debug)]
pub enum Agent {
    Leaf(LeafAgent),
    Composite(CompositeAgent),
}

impl From<LeafAgent> for Agent {
    fn from(agent: LeafAgent) -> Self {
        Self::Leaf(agent)
    }
}

impl From<CompositeAgent> for Agent {
    fn from(agent: CompositeAgent) -> Self {
        Self::Composite(agent)
    }
}

impl Agent {
    pub fn name(&self) -> &str {
        match self {
            Self::Leaf(a) => &a.name,
            Self::Composite(a) => &a.name,
        }
    }

    pub fn output_slot(&self) -> &str {
        match self {
            Self::Leaf(a) => &a.output_slot,
            Self::Composite(a) => &a.output_slot,
        }
    }

    pub fn children(&self) -> &[Agent] {
        match self {
            Self::Leaf(_) => &[],
            Self::Composite(a) => &a.children,
        }
    }

    /// Check the whole tree: non-empty composites, unique names, unique slots.
    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        let mut slots = HashSet::new();
        self.validate_into(&mut names, &mut slots)
    }

    fn validate_into<'a>(
        &'a self,
        names: &mut HashSet<&'a str>,
        slots: &mut HashSet<&'a str>,
    ) -> Result<()> {
        if self.name().trim().is_empty() {
            return Err(Error::Config("agent name is empty".into()));
        }
        if self.output_slot().trim().is_empty() {
            return Err(Error::Config(format!(
                "agent '{}' has an empty output slot",
                self.name()
            )));
        }
        if !names.insert(self.name()) {
            return Err(Error::Config(format!(
                "agent name '{}' is used twice",
                self.name()
            )));
        }
        if !slots.insert(self.output_slot()) {
            return Err(Error::Config(format!(
                "output slot '{}' is used twice",
                self.output_slot()
            )));
        }
        if let Self::Composite(composite) = self {
            if composite.children.is_empty() {
                return Err(Error::Config(format!(
                    "composite agent '{}' has no children",
                    composite.name
                )));
            }
            for child in &composite.children {
                child.validate_into(names, slots)?;
            }
        }
        Ok(())
    }

    /// Run this agent. `depth` is zero for the root.
    ///
    /// On success the result is published under the agent's output slot and
    /// an event is emitted. Failures come back wrapped in [`Error::Agent`].
    pub fn invoke<'a>(
        &'a self,
        cx: &'a Invocation<'a>,
        input: AgentInput,
        depth: usize,
    ) -> BoxFuture<'a, Result<AgentOutput>> {
        async move {
            let name = self.name();
            let mut state = AgentState::Pending;
            transition(name, &mut state, AgentState::Running);
            cx.telemetry
                .metrics
                .increment_with("agent.invocations", &[("agent", name)], 1);
            let start = cx.now();

            let result = match self {
                Self::Leaf(leaf) => leaf.run(cx, &input).await.map(|value| AgentOutput {
                    slots: Vec::new(),
                    value,
                }),
                Self::Composite(composite) => composite.run(cx, input, depth).await,
            }
            .and_then(|output| self.publish(cx, output, depth));

            cx.span(format!("agent:{name}"), start);
            match result {
                Ok(output) => {
                    transition(name, &mut state, AgentState::Succeeded);
                    Ok(output)
                }
                Err(e) => {
                    transition(name, &mut state, AgentState::Failed);
                    cx.telemetry
                        .metrics
                        .increment_with("agent.failures", &[("agent", name)], 1);
                    tracing::warn!(agent = name, depth, error = %e, "agent failed");
                    Err(Error::Agent {
                        agent: name.to_string(),
                        source: Box::new(e),
                    })
                }
            }
        }
        .boxed()
    }

    fn publish(&self, cx: &Invocation<'_>, mut output: AgentOutput, depth: usize) -> Result<AgentOutput> {
        let slot = self.output_slot();
        cx.sink.publish(slot, &output.value)?;

        let event = Event::agent(self.name(), output.value.clone());
        let event = if depth == 0 {
            event.terminal()
        } else {
            event.suppressed()
        };
        cx.sink.emit(event)?;

        output.slots.push((slot.to_string(), output.value.clone()));
        Ok(output)
    }
}

fn transition(agent: &str, state: &mut AgentState, next: AgentState) {
    tracing::debug!(agent, from = ?*state, to = ?next, "agent state");
    *state = next;
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::*;

    /// Collects everything an agent publishes.
    #[derive(Debug, Default)]
    pub struct RecordingSink {
        pub state: Mutex<Vec<(String, Value)>>,
        pub events: Mutex<Vec<Event>>,
    }

    impl EventSink for RecordingSink {
        fn publish(&self, slot: &str, value: &Value) -> Result<()> {
            self.state
                .lock()
                .unwrap()
                .push((slot.to_string(), value.clone()));
            Ok(())
        }

        fn emit(&self, event: Event) -> Result<()> {
            self.events.lock().unwrap().push(event);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::providers::ScriptedModel;

    fn leaf(name: &str, slot: &str) -> Agent {
        LeafAgent::builder(name, slot, Arc::new(ScriptedModel::new()))
            .build()
            .into()
    }

    #[test]
    fn validate_accepts_well_formed_tree() {
        let root = CompositeAgent::new("root", "result", vec![leaf("a", "a"), leaf("b", "b")]);
        Agent::from(root).validate().unwrap();
    }

    #[test]
    fn validate_rejects_duplicate_slots() {
        let root = CompositeAgent::new("root", "result", vec![leaf("a", "x"), leaf("b", "x")]);
        assert!(matches!(Agent::from(root).validate(), Err(Error::Config(_))));
    }

    #[test]
    fn validate_rejects_empty_composite() {
        let root = CompositeAgent::new("root", "result", Vec::new());
        assert!(matches!(Agent::from(root).validate(), Err(Error::Config(_))));
    }

    #[test]
    fn validate_rejects_duplicate_names_in_nested_tree() {
        let inner = CompositeAgent::new("a", "inner", vec![leaf("b", "b")]);
        let root = CompositeAgent::new("root", "result", vec![leaf("a", "a"), inner.into()]);
        assert!(Agent::from(root).validate().is_err());
    }
}
