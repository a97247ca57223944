//! Agent orchestration runtime.
//!
//! This crate drives a tree of model-backed agents over a session:
//!
//! - **Model**: the [`ModelClient`](model::ModelClient) contract, with a
//!   timeout and bounded-retry [`CallPolicy`](model::CallPolicy) applied at
//!   every leaf call. Providers live in [`providers`].
//! - **Tools**: synchronous [`Tool`](tools::Tool)s whose contracts are
//!   checked when they enter a [`ToolRegistry`](tools::ToolRegistry).
//! - **Agents**: an [`Agent`] is a leaf (model plus at most one tool round) or
//!   a composite that runs its children in declared order.
//! - **Runner**: [`Runner::run`] claims the session, then lazily streams the
//!   run's events, recording spans and metrics as it goes.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use futures::StreamExt;
//! use runtime::providers::MockModel;
//! use runtime::{Agent, CompositeAgent, LeafAgent, Runner};
//! use storage::SessionStore;
//! use telemetry::Telemetry;
//!
//! # async fn example() -> runtime::Result<()> {
//! let model = Arc::new(MockModel::new());
//! let root: Agent = CompositeAgent::new(
//!     "profiler",
//!     "recommendation",
//!     vec![
//!         LeafAgent::builder("classifier", "classification", model.clone()).build().into(),
//!         LeafAgent::builder("strategist", "plan", model).build().into(),
//!     ],
//! )
//! .into();
//!
//! let runner = Runner::new(
//!     "profiler",
//!     root,
//!     Arc::new(SessionStore::new()),
//!     Arc::new(Telemetry::new()),
//! )?;
//! let mut events = runner.run("u1", "s1", "Analyze sample.pdf")?;
//! while let Some(event) = events.next().await {
//!     println!("{}: {:?}", event.author, event.data());
//! }
//! # Ok(())
//! # }
//! ```

pub mod agent;
mod error;
pub mod model;
pub mod providers;
mod runner;
pub mod tools;

pub use agent::{
    Agent, AgentInput, AgentOutput, AgentState, CompositeAgent, Context, EventSink, Invocation,
    LeafAgent,
};
pub use error::{Error, Result};
pub use runner::{
    HISTORICAL_CONTEXT, RUN_DURATION_MS, RUNS_ACTIVE, RUNS_CANCELLED, RUNS_FAILED, RUNS_TOTAL,
    RunStream, Runner,
};
