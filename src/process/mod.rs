//! Process Adapter
//!
//! Spawns the shell attached to a freshly allocated pseudo-terminal and
//! exposes it as channels:
//! - output chunks as they are produced
//! - raw input bytes
//! - a one-shot exit notification

pub mod pty;

pub use pty::{NativePtySpawner, ProcessHandle, ProcessIo};

use serde::Serialize;
use std::fmt;

use crate::config::{LimitsConfig, OverflowPolicy, ShellConfig};
use crate::error::BridgeResult;

/// How the child process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProcessExit {
    pub code: u32,
    pub success: bool,
}

impl ProcessExit {
    /// Exit status that could not be collected from the OS
    pub fn unknown() -> Self {
        Self {
            code: u32::MAX,
            success: false,
        }
    }
}

impl fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.code == u32::MAX {
            write!(f, "unknown exit status")
        } else {
            write!(f, "exit code {}", self.code)
        }
    }
}

/// Outbound queue sizing for one process
#[derive(Debug, Clone, Copy)]
pub struct QueuePolicy {
    pub capacity: usize,
    pub overflow: OverflowPolicy,
}

impl From<&LimitsConfig> for QueuePolicy {
    fn from(limits: &LimitsConfig) -> Self {
        Self {
            capacity: limits.output_queue_capacity.max(1),
            overflow: limits.overflow,
        }
    }
}

/// Creates PTY-backed processes for admitted sessions
pub trait ProcessSpawner: Send + Sync {
    fn spawn(&self, shell: &ShellConfig, queue: QueuePolicy) -> BridgeResult<ProcessHandle>;
}
