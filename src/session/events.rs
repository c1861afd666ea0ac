//! Session Events
//!
//! Lifecycle notifications broadcast by the session registry.

use serde::Serialize;

use super::state::{SessionId, SessionStatus};

/// Events that can be emitted during a session
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SessionEvent {
    /// Session status changed
    StatusChanged {
        session_id: SessionId,
        old_status: SessionStatus,
        new_status: SessionStatus,
    },

    /// Shell process started
    Spawned {
        session_id: SessionId,
        #[serde(skip_serializing_if = "Option::is_none")]
        pid: Option<u32>,
    },

    /// Shell process reaped
    Exited {
        session_id: SessionId,
        code: u32,
        success: bool,
    },

    /// Session fully released
    Closed {
        session_id: SessionId,
        reason: String,
    },
}

impl SessionEvent {
    /// Get the session ID from any event
    pub fn session_id(&self) -> SessionId {
        match self {
            Self::StatusChanged { session_id, .. } => *session_id,
            Self::Spawned { session_id, .. } => *session_id,
            Self::Exited { session_id, .. } => *session_id,
            Self::Closed { session_id, .. } => *session_id,
        }
    }

    pub fn event_name(&self) -> &'static str {
        match self {
            Self::StatusChanged { .. } => "session-status",
            Self::Spawned { .. } => "session-spawned",
            Self::Exited { .. } => "session-exited",
            Self::Closed { .. } => "session-closed",
        }
    }
}
