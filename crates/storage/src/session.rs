//! In-memory session store.
//!
//! Every session sits behind its own mutex, so operations on one session are
//! serialized while different sessions never contend beyond a short map lookup.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::{Event, SessionError, SessionKey};

/// A snapshot of one session.
#[derive(Debug, Clone)]
pub struct Session {
    pub key: SessionKey,
    pub events: Vec<Event>,
    pub state: BTreeMap<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    fn new(key: SessionKey) -> Self {
        let now = Utc::now();
        Self {
            key,
            events: Vec::new(),
            state: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Summary of a session for listing.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub key: SessionKey,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub event_count: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreStats {
    pub total_sessions: usize,
    pub total_events: usize,
    pub apps: Vec<String>,
}

#[derive(Debug)]
struct SessionCell {
    session: Mutex<Session>,
    running: AtomicBool,
}

impl SessionCell {
    fn lock(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Proof that a session exists (or existed). Cheap to clone.
///
/// A handle keeps pointing at the session it was issued for: once that
/// session is deleted, operations through the handle fail with
/// [`SessionError::NotFound`] even if the key is reused.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    key: SessionKey,
    cell: Arc<SessionCell>,
}

impl SessionHandle {
    pub fn key(&self) -> &SessionKey {
        &self.key
    }
}

/// Marks a session as having an active run. Released on drop.
#[derive(Debug)]
pub struct RunLease {
    key: SessionKey,
    cell: Arc<SessionCell>,
}

impl RunLease {
    pub fn key(&self) -> &SessionKey {
        &self.key
    }
}

impl Drop for RunLease {
    fn drop(&mut self) {
        self.cell.running.store(false, Ordering::Release);
        tracing::debug!(session = %self.key, "run lease released");
    }
}

/// Holds every live session, keyed by (app, user, session).
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: RwLock<HashMap<SessionKey, Arc<SessionCell>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<SessionKey, Arc<SessionCell>>> {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<SessionKey, Arc<SessionCell>>> {
        self.sessions.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create a session. Fails if the key is taken.
    pub fn create(&self, key: SessionKey) -> Result<SessionHandle, SessionError> {
        let mut sessions = self.write();
        if sessions.contains_key(&key) {
            return Err(SessionError::Duplicate(key));
        }
        let cell = Arc::new(SessionCell {
            session: Mutex::new(Session::new(key.clone())),
            running: AtomicBool::new(false),
        });
        sessions.insert(key.clone(), Arc::clone(&cell));
        tracing::info!(session = %key, "session created");
        Ok(SessionHandle { key, cell })
    }

    /// Snapshot of a session, if it exists.
    pub fn get(&self, key: &SessionKey) -> Option<Session> {
        self.handle(key).map(|handle| handle.cell.lock().clone())
    }

    pub fn handle(&self, key: &SessionKey) -> Option<SessionHandle> {
        self.read().get(key).map(|cell| SessionHandle {
            key: key.clone(),
            cell: Arc::clone(cell),
        })
    }

    /// Return the existing session or create it.
    pub fn get_or_create(&self, key: SessionKey) -> SessionHandle {
        // A failed create means another caller won the race; look it up again.
        loop {
            if let Some(handle) = self.handle(&key) {
                return handle;
            }
            if let Ok(handle) = self.create(key.clone()) {
                return handle;
            }
        }
    }

    /// Resolve a handle to its live cell, rejecting handles to deleted sessions.
    fn live(&self, handle: &SessionHandle) -> Result<Arc<SessionCell>, SessionError> {
        match self.read().get(&handle.key) {
            Some(cell) if Arc::ptr_eq(cell, &handle.cell) => Ok(Arc::clone(cell)),
            _ => Err(SessionError::NotFound(handle.key.clone())),
        }
    }

    /// Append to the end of the session log.
    pub fn append_event(&self, handle: &SessionHandle, event: Event) -> Result<(), SessionError> {
        let cell = self.live(handle)?;
        let mut session = cell.lock();
        tracing::debug!(
            session = %handle.key,
            author = %event.author,
            terminal = event.terminal,
            visible = event.visible,
            "event appended"
        );
        session.updated_at = event.timestamp;
        session.events.push(event);
        Ok(())
    }

    /// Overwrite one state key.
    pub fn set_state(
        &self,
        handle: &SessionHandle,
        key: impl Into<String>,
        value: Value,
    ) -> Result<(), SessionError> {
        let cell = self.live(handle)?;
        let mut session = cell.lock();
        session.state.insert(key.into(), value);
        session.updated_at = Utc::now();
        Ok(())
    }

    pub fn get_state(&self, handle: &SessionHandle, key: &str) -> Result<Option<Value>, SessionError> {
        let cell = self.live(handle)?;
        let value = cell.lock().state.get(key).cloned();
        Ok(value)
    }

    /// The whole state map.
    pub fn state(&self, handle: &SessionHandle) -> Result<BTreeMap<String, Value>, SessionError> {
        let cell = self.live(handle)?;
        let state = cell.lock().state.clone();
        Ok(state)
    }

    pub fn events(&self, handle: &SessionHandle) -> Result<Vec<Event>, SessionError> {
        self.events_since(handle, 0)
    }

    /// Events from position `offset` onward.
    pub fn events_since(
        &self,
        handle: &SessionHandle,
        offset: usize,
    ) -> Result<Vec<Event>, SessionError> {
        let cell = self.live(handle)?;
        let session = cell.lock();
        Ok(session.events.iter().skip(offset).cloned().collect())
    }

    /// Claim the session for one run. A second claim fails until the lease drops.
    pub fn begin_run(&self, handle: &SessionHandle) -> Result<RunLease, SessionError> {
        let cell = self.live(handle)?;
        if cell
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SessionError::Busy(handle.key.clone()));
        }
        Ok(RunLease {
            key: handle.key.clone(),
            cell,
        })
    }

    /// Remove a session. Returns whether it existed.
    pub fn delete(&self, key: &SessionKey) -> bool {
        let removed = self.write().remove(key).is_some();
        if removed {
            tracing::info!(session = %key, "session deleted");
        }
        removed
    }

    /// Sessions for one user of one app, most recently updated first.
    pub fn list(&self, app: &str, user: &str) -> Vec<SessionSummary> {
        let cells: Vec<Arc<SessionCell>> = self
            .read()
            .iter()
            .filter(|(key, _)| key.app == app && key.user == user)
            .map(|(_, cell)| Arc::clone(cell))
            .collect();

        let mut summaries: Vec<SessionSummary> = cells
            .iter()
            .map(|cell| {
                let session = cell.lock();
                SessionSummary {
                    key: session.key.clone(),
                    created_at: session.created_at,
                    updated_at: session.updated_at,
                    event_count: session.events.len(),
                }
            })
            .collect();
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.key.cmp(&b.key)));
        summaries
    }

    pub fn stats(&self) -> StoreStats {
        let cells: Vec<Arc<SessionCell>> = self.read().values().cloned().collect();
        let mut apps = BTreeSet::new();
        let mut total_events = 0;
        for cell in &cells {
            let session = cell.lock();
            apps.insert(session.key.app.clone());
            total_events += session.events.len();
        }
        StoreStats {
            total_sessions: cells.len(),
            total_events,
            apps: apps.into_iter().collect(),
        }
    }
}
