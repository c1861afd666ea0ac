//! Stream Bridge
//!
//! Two concurrent data paths per session:
//! - output: PTY chunks forwarded verbatim, one socket frame per chunk
//! - input: socket payloads written verbatim into the PTY
//!
//! The first termination trigger wins and ends both paths. Cleanup is not
//! done here; the caller runs the session's single teardown afterwards.

use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use log::debug;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::Instant;

use crate::config::LimitsConfig;
use crate::process::{ProcessExit, ProcessIo};

/// How long output produced before exit may still be forwarded
pub const OUTPUT_FLUSH_TIMEOUT: Duration = Duration::from_millis(250);

/// Why a bridge stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// Shell process exited
    ProcessExited(ProcessExit),
    /// PTY output reached EOF without an exit status
    OutputEnded,
    /// Client closed the connection
    SocketClosed,
    /// Receiving from the socket failed
    SocketError(String),
    /// Sending to the socket failed
    SendFailed(String),
    /// The PTY no longer accepts input
    InputFailed,
    /// No traffic in either direction for the configured period
    IdleTimeout,
    /// Server-initiated shutdown
    Shutdown,
}

impl Termination {
    /// Whether the process side ended first
    pub fn is_process_exit(&self) -> bool {
        matches!(self, Self::ProcessExited(_) | Self::OutputEnded)
    }
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ProcessExited(exit) => write!(f, "process exited ({})", exit),
            Self::OutputEnded => write!(f, "process output ended"),
            Self::SocketClosed => write!(f, "socket closed"),
            Self::SocketError(e) => write!(f, "socket error: {}", e),
            Self::SendFailed(e) => write!(f, "socket send failed: {}", e),
            Self::InputFailed => write!(f, "process input closed"),
            Self::IdleTimeout => write!(f, "idle timeout"),
            Self::Shutdown => write!(f, "server shutdown"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BridgeOptions {
    pub idle_timeout: Option<Duration>,
    pub flush_timeout: Duration,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            idle_timeout: None,
            flush_timeout: OUTPUT_FLUSH_TIMEOUT,
        }
    }
}

impl From<&LimitsConfig> for BridgeOptions {
    fn from(limits: &LimitsConfig) -> Self {
        Self {
            idle_timeout: limits.idle_timeout(),
            flush_timeout: OUTPUT_FLUSH_TIMEOUT,
        }
    }
}

/// Time of the last byte seen in either direction
struct ActivityClock {
    origin: Instant,
    last_ms: AtomicU64,
}

impl ActivityClock {
    fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let elapsed = self.origin.elapsed().as_millis() as u64;
        self.last_ms.fetch_max(elapsed, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_ms.load(Ordering::Relaxed));
        self.origin.elapsed().saturating_sub(last)
    }
}

enum OutputStep {
    Chunk(Bytes),
    Eof,
    Exited,
    DrainElapsed,
}

/// Run both data paths until the first termination trigger
pub async fn run<Tx, Rx, E>(
    io: ProcessIo,
    sink: &mut Tx,
    source: &mut Rx,
    shutdown: &Notify,
    options: BridgeOptions,
) -> Termination
where
    Tx: Sink<Bytes> + Unpin,
    Tx::Error: fmt::Display,
    Rx: Stream<Item = Result<Bytes, E>> + Unpin,
    E: fmt::Display,
{
    let ProcessIo {
        mut output,
        input,
        mut exit,
    } = io;
    let mut exit_backstop = exit.clone();
    let clock = ActivityClock::new();

    tokio::select! {
        t = forward_output(&mut output, &mut exit, sink, &clock, options.flush_timeout) => t,
        t = forward_input(source, &input, &clock) => t,
        // Output forwarding may be stuck on a stalled client
        status = exit_after_flush(&mut exit_backstop, options.flush_timeout * 2) => {
            Termination::ProcessExited(status)
        }
        _ = shutdown.notified() => Termination::Shutdown,
        _ = idle_watch(&clock, options.idle_timeout) => Termination::IdleTimeout,
    }
}

async fn forward_output<Tx>(
    output: &mut mpsc::Receiver<Bytes>,
    exit: &mut watch::Receiver<Option<ProcessExit>>,
    sink: &mut Tx,
    clock: &ActivityClock,
    flush_timeout: Duration,
) -> Termination
where
    Tx: Sink<Bytes> + Unpin,
    Tx::Error: fmt::Display,
{
    let mut drain_until: Option<Instant> = None;
    loop {
        let step = tokio::select! {
            chunk = output.recv() => chunk.map_or(OutputStep::Eof, OutputStep::Chunk),
            _ = wait_exit(exit), if drain_until.is_none() => OutputStep::Exited,
            _ = tokio::time::sleep_until(drain_until.unwrap_or_else(Instant::now)),
                if drain_until.is_some() => OutputStep::DrainElapsed,
        };

        match step {
            OutputStep::Chunk(chunk) => {
                clock.touch();
                if let Err(e) = sink.send(chunk).await {
                    return Termination::SendFailed(e.to_string());
                }
            }
            OutputStep::Exited => {
                debug!("Shell exited, flushing remaining output");
                drain_until = Some(Instant::now() + flush_timeout);
            }
            OutputStep::DrainElapsed => {
                return Termination::ProcessExited(current_exit(exit));
            }
            OutputStep::Eof => {
                return match tokio::time::timeout(flush_timeout, wait_exit(exit)).await {
                    Ok(status) => Termination::ProcessExited(status),
                    Err(_) => Termination::OutputEnded,
                };
            }
        }
    }
}

async fn forward_input<Rx, E>(
    source: &mut Rx,
    input: &mpsc::Sender<Bytes>,
    clock: &ActivityClock,
) -> Termination
where
    Rx: Stream<Item = Result<Bytes, E>> + Unpin,
    E: fmt::Display,
{
    while let Some(frame) = source.next().await {
        match frame {
            Ok(payload) => {
                clock.touch();
                if payload.is_empty() {
                    continue;
                }
                if input.send(payload).await.is_err() {
                    return Termination::InputFailed;
                }
            }
            Err(e) => return Termination::SocketError(e.to_string()),
        }
    }
    Termination::SocketClosed
}

async fn wait_exit(exit: &mut watch::Receiver<Option<ProcessExit>>) -> ProcessExit {
    let status = exit.wait_for(Option::is_some).await.ok().and_then(|s| *s);
    status.unwrap_or_else(ProcessExit::unknown)
}

fn current_exit(exit: &watch::Receiver<Option<ProcessExit>>) -> ProcessExit {
    (*exit.borrow()).unwrap_or_else(ProcessExit::unknown)
}

async fn exit_after_flush(
    exit: &mut watch::Receiver<Option<ProcessExit>>,
    delay: Duration,
) -> ProcessExit {
    let status = wait_exit(exit).await;
    tokio::time::sleep(delay).await;
    status
}

async fn idle_watch(clock: &ActivityClock, timeout: Option<Duration>) {
    let Some(timeout) = timeout else {
        return std::future::pending().await;
    };
    loop {
        let idle = clock.idle_for();
        if idle >= timeout {
            return;
        }
        tokio::time::sleep(timeout - idle).await;
    }
}
