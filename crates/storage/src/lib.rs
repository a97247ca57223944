//! Session and memory storage for the conductor runtime.
//!
//! Two independent stores live here:
//!
//! - [`SessionStore`] keeps per-conversation event logs and key/value state in
//!   memory. Each session is guarded by its own lock, and [`RunLease`] enforces
//!   a single active run per session.
//! - [`MemoryBank`] is a durable SQLite file of [`MemoryRecord`]s shared by all
//!   sessions, with search and token-bounded compaction into a [`Digest`].
//!
//! # Example
//!
//! ```
//! use serde_json::json;
//! use storage::{Event, MemoryBank, SessionKey, SessionStore};
//!
//! let sessions = SessionStore::new();
//! let handle = sessions.create(SessionKey::new("profiler", "u1", "s1"))?;
//! sessions.append_event(&handle, Event::user("Analyze sample.pdf"))?;
//! sessions.set_state(&handle, "classification", json!(["a", "b"]))?;
//!
//! let memory = MemoryBank::in_memory()?;
//! memory.add("u1", "exam_analysis", json!({"topics": 3}), &["biology".into()])?;
//! let digest = memory.compact("u1", 200)?;
//! assert!(digest.text.starts_with("Historical Context:"));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod compact;
mod error;
mod event;
mod memory;
mod session;

pub use compact::{CharEstimate, DIGEST_HEADER, Digest, ScoreWeights, TokenCounter, render_line};
pub use error::{MemoryError, Result, SessionError};
pub use event::{Event, Part, Role, SessionKey};
pub use memory::{MemoryBank, MemoryId, MemoryRecord, MemorySummary};
pub use session::{RunLease, Session, SessionHandle, SessionStore, SessionSummary, StoreStats};
