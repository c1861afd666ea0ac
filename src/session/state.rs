//! Session State
//!
//! Lifecycle state of a single bridged session.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;
use uuid::Uuid;

use super::events::SessionEvent;
use crate::gate::Principal;
use crate::process::ProcessExit;

/// Unique identifier of a live connection's session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Status of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Admitted, process not yet running
    #[default]
    Initializing,
    /// Process and socket both live, bytes flowing
    Active,
    /// First termination trigger seen, cleanup in progress
    TearingDown,
    /// Process reaped, socket closed, registry entry removed
    Closed,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initializing => write!(f, "initializing"),
            Self::Active => write!(f, "active"),
            Self::TearingDown => write!(f, "tearing_down"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Complete state of a single session
#[derive(Debug)]
pub struct SessionState {
    pub id: SessionId,
    /// Identity that owns this session
    pub principal: Principal,
    pub status: SessionStatus,
    /// Process ID once spawned
    pub pid: Option<u32>,
    pub exit: Option<ProcessExit>,
    pub close_reason: Option<String>,
    /// Diagnostics only
    pub created_at: DateTime<Utc>,
    event_tx: broadcast::Sender<SessionEvent>,
}

impl SessionState {
    pub fn new(
        id: SessionId,
        principal: Principal,
        event_tx: broadcast::Sender<SessionEvent>,
    ) -> Self {
        Self {
            id,
            principal,
            status: SessionStatus::Initializing,
            pid: None,
            exit: None,
            close_reason: None,
            created_at: Utc::now(),
            event_tx,
        }
    }

    /// Emit an event to registry subscribers. Having none is fine.
    pub fn emit(&self, event: SessionEvent) {
        let _ = self.event_tx.send(event);
    }

    fn set_status(&mut self, status: SessionStatus) {
        let old_status = self.status;
        if old_status == status {
            return;
        }
        self.status = status;

        self.emit(SessionEvent::StatusChanged {
            session_id: self.id,
            old_status,
            new_status: status,
        });
    }

    /// Process spawned and socket attached
    pub fn set_active(&mut self, pid: Option<u32>) {
        self.pid = pid;
        self.emit(SessionEvent::Spawned {
            session_id: self.id,
            pid,
        });
        self.set_status(SessionStatus::Active);
    }

    /// Claim the teardown. Only the first caller gets `true`.
    pub fn begin_teardown(&mut self) -> bool {
        match self.status {
            SessionStatus::Initializing | SessionStatus::Active => {
                self.set_status(SessionStatus::TearingDown);
                true
            }
            SessionStatus::TearingDown | SessionStatus::Closed => false,
        }
    }

    pub fn record_exit(&mut self, exit: ProcessExit) {
        if self.exit.is_some() {
            return;
        }
        self.exit = Some(exit);
        self.emit(SessionEvent::Exited {
            session_id: self.id,
            code: exit.code,
            success: exit.success,
        });
    }

    pub fn set_closed(&mut self, reason: impl Into<String>) {
        if self.status == SessionStatus::Closed {
            return;
        }
        let reason = reason.into();
        self.close_reason = Some(reason.clone());
        self.pid = None;
        self.set_status(SessionStatus::Closed);
        self.emit(SessionEvent::Closed {
            session_id: self.id,
            reason,
        });
    }

    pub fn is_closed(&self) -> bool {
        self.status == SessionStatus::Closed
    }

    /// Seconds since the session was created
    pub fn age_secs(&self) -> i64 {
        (Utc::now() - self.created_at).num_seconds()
    }
}
