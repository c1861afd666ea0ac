//! Session Registry
//!
//! Process-wide table of live sessions keyed by session id. It bounds the
//! number of concurrent sessions and makes teardown reachable from outside
//! the session's own task.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::{debug, error, info};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::{broadcast, Notify, OwnedSemaphorePermit, Semaphore};

use super::events::SessionEvent;
use super::state::{SessionId, SessionState};
use crate::error::{BridgeError, BridgeResult};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Registry view of one live session
struct SessionEntry {
    state: Arc<RwLock<SessionState>>,
    shutdown: Arc<Notify>,
}

/// Table of live sessions
pub struct SessionRegistry {
    sessions: DashMap<SessionId, SessionEntry>,
    capacity: Arc<Semaphore>,
    max_sessions: usize,
    event_tx: broadcast::Sender<SessionEvent>,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            sessions: DashMap::new(),
            capacity: Arc::new(Semaphore::new(max_sessions)),
            max_sessions,
            event_tx,
        }
    }

    /// Subscribe to lifecycle events of every session
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    /// Sender handed to new session states
    pub fn event_sender(&self) -> broadcast::Sender<SessionEvent> {
        self.event_tx.clone()
    }

    /// Reserve a slot for a new session. The slot is freed when the permit drops.
    pub fn try_reserve(&self) -> BridgeResult<OwnedSemaphorePermit> {
        self.capacity
            .clone()
            .try_acquire_owned()
            .map_err(|_| BridgeError::CapacityExhausted(self.max_sessions))
    }

    /// Insert a session. An existing id is never replaced.
    pub fn register(
        &self,
        state: Arc<RwLock<SessionState>>,
        shutdown: Arc<Notify>,
    ) -> BridgeResult<()> {
        let id = state.read().id;
        match self.sessions.entry(id) {
            Entry::Occupied(_) => {
                error!("Session {} is already registered, rejecting the new one", id);
                Err(BridgeError::DuplicateId(id))
            }
            Entry::Vacant(slot) => {
                slot.insert(SessionEntry { state, shutdown });
                debug!("Registered session {}", id);
                Ok(())
            }
        }
    }

    /// Remove a session. Returns whether it was present; absence is not an error.
    pub fn unregister(&self, id: &SessionId) -> bool {
        let removed = self.sessions.remove(id).is_some();
        if removed {
            debug!("Unregistered session {}", id);
        }
        removed
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.sessions.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    /// Ask one session to tear itself down
    pub fn request_shutdown(&self, id: &SessionId) -> bool {
        match self.sessions.get(id) {
            Some(entry) => {
                entry.shutdown.notify_one();
                true
            }
            None => false,
        }
    }

    /// Ask every live session to tear itself down
    pub fn shutdown_all(&self) -> usize {
        let mut count = 0;
        for entry in self.sessions.iter() {
            entry.shutdown.notify_one();
            count += 1;
        }
        info!("Requested shutdown of {} sessions", count);
        count
    }
}
