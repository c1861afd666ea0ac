//! Native PTY processes
//!
//! Each process gets three helper threads: a reader draining the PTY master
//! into the outbound queue, a writer feeding keystrokes into it, and a waiter
//! that reaps the child and publishes its exit status exactly once.

use bytes::Bytes;
use log::{debug, error, info, warn};
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use std::future::Future;
use std::io::{Read, Write};
use std::sync::mpsc::{self as std_mpsc, SendError};
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;

use super::{ProcessExit, ProcessSpawner, QueuePolicy};
use crate::config::{OverflowPolicy, ShellConfig};
use crate::error::{BridgeError, BridgeResult};

const READ_BUFFER_SIZE: usize = 16 * 1024;
const INPUT_QUEUE_CAPACITY: usize = 256;

/// Channel ends used by the stream bridge
pub struct ProcessIo {
    /// Output chunks in production order; closes at EOF
    pub output: mpsc::Receiver<Bytes>,
    /// Raw bytes for the terminal's input side
    pub input: mpsc::Sender<Bytes>,
    /// Becomes `Some` once, when the child has been reaped
    pub exit: watch::Receiver<Option<ProcessExit>>,
}

/// Exclusive ownership of one spawned shell and its PTY
pub struct ProcessHandle {
    pid: Option<u32>,
    output: Option<mpsc::Receiver<Bytes>>,
    input: Option<mpsc::Sender<Bytes>>,
    exit: watch::Receiver<Option<ProcessExit>>,
    killer: Option<Box<dyn ChildKiller + Send + Sync>>,
    master: Option<Box<dyn MasterPty + Send>>,
    terminated: bool,
}

impl ProcessHandle {
    /// OS process id, when the platform reports one
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Hand the I/O channels to the bridge. Returns `None` after the first call.
    pub fn take_io(&mut self) -> Option<ProcessIo> {
        let output = self.output.take()?;
        let input = self.input.take()?;
        Some(ProcessIo {
            output,
            input,
            exit: self.exit.clone(),
        })
    }

    pub fn exit_status(&self) -> Option<ProcessExit> {
        *self.exit.borrow()
    }

    pub fn has_exited(&self) -> bool {
        self.exit_status().is_some()
    }

    /// Wait until the waiter thread has reaped the child.
    ///
    /// The returned future does not borrow the handle.
    pub fn wait(&self) -> impl Future<Output = Option<ProcessExit>> + Send + 'static {
        let mut exit = self.exit.clone();
        async move {
            let status = exit.wait_for(Option::is_some).await.ok().and_then(|s| *s);
            status
        }
    }

    /// Hang up the shell, force kill it after `grace`, then release the PTY.
    ///
    /// Safe to call repeatedly and after the process has already exited.
    pub async fn terminate(&mut self, grace: Duration) -> Option<ProcessExit> {
        if self.terminated {
            return self.exit_status();
        }

        if !self.has_exited() {
            self.hang_up();
            if tokio::time::timeout(grace, self.wait()).await.is_err() {
                warn!(
                    "Process {:?} still running {:?} after hang-up, force killing",
                    self.pid, grace
                );
                self.force_kill();
                if tokio::time::timeout(grace, self.wait()).await.is_err() {
                    error!("Process {:?} did not exit after SIGKILL", self.pid);
                }
            }
        }

        self.output.take();
        self.input.take();
        self.killer.take();
        // Closing the master releases the last PTY descriptor held by the server
        self.master.take();
        self.terminated = true;

        debug!("Process {:?} terminated: {:?}", self.pid, self.exit_status());
        self.exit_status()
    }

    #[cfg(unix)]
    fn hang_up(&mut self) {
        if !self.signal(libc::SIGHUP) {
            self.kill_with_killer();
        }
    }

    #[cfg(not(unix))]
    fn hang_up(&mut self) {
        self.kill_with_killer();
    }

    #[cfg(unix)]
    fn force_kill(&mut self) {
        if !self.signal(libc::SIGKILL) {
            self.kill_with_killer();
        }
    }

    #[cfg(not(unix))]
    fn force_kill(&mut self) {
        self.kill_with_killer();
    }

    #[cfg(unix)]
    fn signal(&self, signal: libc::c_int) -> bool {
        self.pid.is_some_and(|pid| send_signal(pid, signal))
    }

    fn kill_with_killer(&mut self) {
        if let Some(killer) = self.killer.as_mut() {
            if let Err(e) = killer.kill() {
                debug!("Kill request for process {:?} failed: {}", self.pid, e);
            }
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if !self.terminated && !self.has_exited() {
            warn!("Process {:?} dropped while running, killing", self.pid);
            self.force_kill();
        }
    }
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: libc::c_int) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: kill(2) has no memory safety requirements
    unsafe { libc::kill(pid, signal) == 0 }
}

/// Spawns shells through the platform's native PTY implementation
#[derive(Debug, Default, Clone, Copy)]
pub struct NativePtySpawner;

impl NativePtySpawner {
    pub fn new() -> Self {
        Self
    }
}

impl ProcessSpawner for NativePtySpawner {
    fn spawn(&self, shell: &ShellConfig, queue: QueuePolicy) -> BridgeResult<ProcessHandle> {
        let program = shell.resolve_program()?;

        let pair = native_pty_system()
            .openpty(PtySize {
                rows: shell.rows,
                cols: shell.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| BridgeError::Spawn(format!("failed to allocate pty: {}", e)))?;
        let portable_pty::PtyPair { master, slave } = pair;

        let reader = master
            .try_clone_reader()
            .map_err(|e| BridgeError::Spawn(format!("failed to open pty reader: {}", e)))?;
        let writer = master
            .take_writer()
            .map_err(|e| BridgeError::Spawn(format!("failed to open pty writer: {}", e)))?;

        let mut cmd = CommandBuilder::new(&program);
        cmd.args(&shell.args);
        cmd.env_clear();
        for (key, value) in shell.environment() {
            cmd.env(key, value);
        }
        if let Some(dir) = shell.working_dir() {
            cmd.cwd(dir);
        }

        let child = slave.spawn_command(cmd).map_err(|e| {
            BridgeError::Spawn(format!("failed to start {}: {}", program.display(), e))
        })?;
        // The child holds its own copy of the slave side
        drop(slave);

        let pid = child.process_id();
        let mut killer = child.clone_killer();

        let (exit_tx, exit_rx) = watch::channel(None);
        let (output_tx, output_rx) = mpsc::channel(queue.capacity);
        let (input_tx, input_rx) = mpsc::channel(INPUT_QUEUE_CAPACITY);
        let (child_tx, child_rx) = std_mpsc::channel();

        let started = spawn_waiter(child_rx, exit_tx)
            .and_then(|_| spawn_reader(reader, output_tx, queue.overflow))
            .and_then(|_| spawn_writer(writer, input_rx));
        if let Err(e) = started {
            abandon_child(killer.as_mut(), &child_tx, child);
            return Err(e);
        }
        if let Err(SendError(child)) = child_tx.send(child) {
            abandon_child(killer.as_mut(), &child_tx, child);
            return Err(BridgeError::Spawn("pty waiter thread exited early".to_string()));
        }

        info!(
            "Spawned {} (pid {:?}) on a {}x{} pty",
            program.display(),
            pid,
            shell.cols,
            shell.rows
        );

        Ok(ProcessHandle {
            pid,
            output: Some(output_rx),
            input: Some(input_tx),
            exit: exit_rx,
            killer: Some(killer),
            master: Some(master),
            terminated: false,
        })
    }
}

fn spawn_helper<F>(name: &str, f: F) -> BridgeResult<()>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(name.to_string())
        .spawn(f)
        .map(|_| ())
        .map_err(|e| BridgeError::Spawn(format!("failed to start {} thread: {}", name, e)))
}

type ChildBox = Box<dyn portable_pty::Child + Send + Sync>;

/// Kill a child whose helper threads did not all start, and make sure it is
/// reaped: by the waiter thread if that one is running, inline otherwise.
fn abandon_child(
    killer: &mut (dyn ChildKiller + Send + Sync),
    child_tx: &std_mpsc::Sender<ChildBox>,
    child: ChildBox,
) {
    if let Err(e) = killer.kill() {
        warn!("Failed to kill shell after a setup error: {}", e);
    }
    if let Err(SendError(mut child)) = child_tx.send(child) {
        match child.wait() {
            Ok(status) => debug!("Reaped abandoned shell: exit code {}", status.exit_code()),
            Err(e) => error!("Failed to reap abandoned shell: {}", e),
        }
    }
}

/// The child arrives over `child_rx` once every helper thread is running
fn spawn_waiter(
    child_rx: std_mpsc::Receiver<ChildBox>,
    exit_tx: watch::Sender<Option<ProcessExit>>,
) -> BridgeResult<()> {
    spawn_helper("shellgate-pty-waiter", move || {
        let Ok(mut child) = child_rx.recv() else {
            return;
        };
        let exit = match child.wait() {
            Ok(status) => ProcessExit {
                code: status.exit_code(),
                success: status.success(),
            },
            Err(e) => {
                error!("Failed to wait for shell process: {}", e);
                ProcessExit::unknown()
            }
        };
        debug!("Shell process {:?} exited: {}", child.process_id(), exit);
        exit_tx.send_replace(Some(exit));
    })
}

fn spawn_reader(
    mut reader: Box<dyn Read + Send>,
    output_tx: mpsc::Sender<Bytes>,
    overflow: OverflowPolicy,
) -> BridgeResult<()> {
    spawn_helper("shellgate-pty-reader", move || {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    let chunk = Bytes::copy_from_slice(&buf[..n]);
                    match overflow {
                        OverflowPolicy::Block => {
                            if output_tx.blocking_send(chunk).is_err() {
                                break;
                            }
                        }
                        OverflowPolicy::Drop => match output_tx.try_send(chunk) {
                            Ok(()) => {}
                            Err(TrySendError::Full(chunk)) => {
                                warn!(
                                    "Output queue full, dropping {} bytes of terminal output",
                                    chunk.len()
                                );
                            }
                            Err(TrySendError::Closed(_)) => break,
                        },
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                // Linux reports EIO on the master once the slave side is gone
                Err(e) => {
                    debug!("PTY read ended: {}", e);
                    break;
                }
            }
        }
    })
}

fn spawn_writer(
    mut writer: Box<dyn Write + Send>,
    mut input_rx: mpsc::Receiver<Bytes>,
) -> BridgeResult<()> {
    spawn_helper("shellgate-pty-writer", move || {
        while let Some(chunk) = input_rx.blocking_recv() {
            if let Err(e) = writer.write_all(&chunk).and_then(|_| writer.flush()) {
                debug!("PTY write failed: {}", e);
                break;
            }
        }
    })
}
