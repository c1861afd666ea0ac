//! Session Management Module
//!
//! A session binds one client connection to one PTY-backed shell:
//! - exclusive ownership of the process handle
//! - registry entry for capacity accounting and external shutdown
//! - one idempotent teardown reachable from every termination path

pub mod bridge;
pub mod events;
pub mod registry;
pub mod state;

pub use bridge::{BridgeOptions, Termination};
pub use events::SessionEvent;
pub use registry::SessionRegistry;
pub use state::{SessionId, SessionState, SessionStatus};

use bytes::Bytes;
use futures::{Sink, SinkExt, Stream};
use log::{debug, info, warn};
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, OwnedSemaphorePermit};

use crate::config::LimitsConfig;
use crate::gate::Principal;
use crate::process::ProcessHandle;

/// Upper bound on waiting for the socket's close handshake
const SOCKET_CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// One live bridged session
pub struct Session {
    id: SessionId,
    state: Arc<RwLock<SessionState>>,
    process: ProcessHandle,
    registry: Arc<SessionRegistry>,
    shutdown: Arc<Notify>,
    options: BridgeOptions,
    kill_grace: Duration,
    _permit: OwnedSemaphorePermit,
}

impl Session {
    pub(crate) fn new(
        state: Arc<RwLock<SessionState>>,
        process: ProcessHandle,
        registry: Arc<SessionRegistry>,
        shutdown: Arc<Notify>,
        permit: OwnedSemaphorePermit,
        limits: &LimitsConfig,
    ) -> Self {
        let id = state.read().id;
        Self {
            id,
            state,
            process,
            registry,
            shutdown,
            options: BridgeOptions::from(limits),
            kill_grace: limits.kill_grace(),
            _permit: permit,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn principal(&self) -> Principal {
        self.state.read().principal.clone()
    }

    pub fn status(&self) -> SessionStatus {
        self.state.read().status
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.pid()
    }

    /// Bridge the process to the socket until either side ends, then tear down
    pub async fn run<Tx, Rx, E>(mut self, mut sink: Tx, mut source: Rx) -> Termination
    where
        Tx: Sink<Bytes> + Unpin,
        Tx::Error: fmt::Display,
        Rx: Stream<Item = Result<Bytes, E>> + Unpin,
        E: fmt::Display,
    {
        let termination = match self.process.take_io() {
            Some(io) => bridge::run(io, &mut sink, &mut source, &self.shutdown, self.options).await,
            None => Termination::OutputEnded,
        };
        info!("Session {} ending: {}", self.id, termination);

        match tokio::time::timeout(SOCKET_CLOSE_TIMEOUT, sink.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Closing socket of session {} failed: {}", self.id, e),
            Err(_) => warn!("Closing socket of session {} timed out", self.id),
        }
        drop(source);

        self.teardown(&termination).await;
        termination
    }

    /// Release the process and the registry entry.
    ///
    /// Only the first call does any work; later calls return `false`.
    pub async fn teardown(&mut self, reason: &Termination) -> bool {
        if !self.state.write().begin_teardown() {
            return false;
        }

        let exit = self.process.terminate(self.kill_grace).await;
        self.registry.unregister(&self.id);

        let mut state = self.state.write();
        if let Some(exit) = exit {
            state.record_exit(exit);
        }
        state.set_closed(reason.to_string());
        info!(
            "Session {} closed after {}s: {}",
            self.id,
            state.age_secs(),
            reason
        );
        true
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let mut state = self.state.write();
        if !state.is_closed() {
            warn!("Session {} dropped before teardown", self.id);
            self.registry.unregister(&self.id);
            state.set_closed("session dropped");
        }
        // The process handle kills its child when dropped unterminated
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::{Config, ShellConfig};
    use crate::gate::{ConnectionGate, StaticTokenAuthorizer};
    use crate::process::NativePtySpawner;
    use futures::channel::mpsc as client;
    use futures::StreamExt;

    fn test_gate(configure: impl FnOnce(&mut Config)) -> ConnectionGate {
        let mut config = Config::default();
        config.shell = ShellConfig::with_program("/bin/sh");
        config.shell.cwd = Some(std::env::temp_dir());
        config.limits.kill_grace_ms = 500;
        configure(&mut config);
        let auth = StaticTokenAuthorizer::default().with_token("secret", "alice");
        ConnectionGate::new(&config, Arc::new(auth), Arc::new(NativePtySpawner::new()))
    }

    fn process_alive(pid: u32) -> bool {
        unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
    }

    async fn collect_until(from_server: &mut client::UnboundedReceiver<Bytes>, needle: &str) -> String {
        let mut seen = Vec::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while !String::from_utf8_lossy(&seen).contains(needle) {
            match tokio::time::timeout_at(deadline, from_server.next()).await {
                Ok(Some(chunk)) => seen.extend_from_slice(&chunk),
                Ok(None) => break,
                Err(_) => panic!("timed out waiting for {:?}", needle),
            }
        }
        String::from_utf8_lossy(&seen).into_owned()
    }

    fn assert_send<T: Send>(_: &T) {}

    #[tokio::test]
    async fn test_session_futures_are_send() {
        let gate = test_gate(|_| {});
        let mut session = gate.admit(Some("secret")).await.unwrap();

        let teardown = session.teardown(&Termination::Shutdown);
        assert_send(&teardown);
        assert!(teardown.await);

        let (_to_server, source) = client::unbounded::<Result<Bytes, String>>();
        let (sink, _from_server) = client::unbounded::<Bytes>();
        let run = session.run(sink, source);
        assert_send(&run);
        // Already torn down, so there is nothing left to bridge
        tokio::time::timeout(Duration::from_secs(10), run).await.unwrap();
        assert!(gate.registry().is_empty());
    }

    #[tokio::test]
    async fn test_socket_close_terminates_process() {
        let gate = test_gate(|_| {});
        let session = gate.admit(Some("secret")).await.unwrap();
        let id = session.id();
        let pid = session.pid().unwrap();
        assert_eq!(session.status(), SessionStatus::Active);
        assert_eq!(session.principal().as_str(), "alice");
        assert!(gate.registry().contains(&id));

        let (to_server, source) = client::unbounded::<Result<Bytes, String>>();
        let (sink, _from_server) = client::unbounded::<Bytes>();
        drop(to_server);

        let termination = tokio::time::timeout(Duration::from_secs(10), session.run(sink, source))
            .await
            .unwrap();
        assert_eq!(termination, Termination::SocketClosed);
        assert!(!gate.registry().contains(&id));
        assert!(!process_alive(pid));
    }

    #[tokio::test]
    async fn test_process_exit_closes_socket() {
        let gate = test_gate(|_| {});
        let session = gate.admit(Some("secret")).await.unwrap();
        let id = session.id();

        let (to_server, source) = client::unbounded::<Result<Bytes, String>>();
        let (sink, mut from_server) = client::unbounded::<Bytes>();
        let task = tokio::spawn(session.run(sink, source));

        to_server
            .unbounded_send(Ok(Bytes::from_static(b"echo hi\n")))
            .unwrap();
        collect_until(&mut from_server, "hi").await;
        to_server
            .unbounded_send(Ok(Bytes::from_static(b"exit 0\n")))
            .unwrap();

        let termination = tokio::time::timeout(Duration::from_secs(10), task)
            .await
            .unwrap()
            .unwrap();
        assert!(termination.is_process_exit());

        // Socket side observed closed without the client closing anything
        let rest = tokio::time::timeout(Duration::from_secs(5), async {
            while from_server.next().await.is_some() {}
        })
        .await;
        assert!(rest.is_ok());
        assert!(!gate.registry().contains(&id));
        drop(to_server);
    }

    #[tokio::test]
    async fn test_writes_applied_in_order() {
        let gate = test_gate(|_| {});
        let session = gate.admit(Some("secret")).await.unwrap();

        let (to_server, source) = client::unbounded::<Result<Bytes, String>>();
        let (sink, mut from_server) = client::unbounded::<Bytes>();
        let task = tokio::spawn(session.run(sink, source));

        for line in [
            "echo first-$((1+0))\n",
            "echo second-$((1+1))\n",
            "echo third-$((1+2))\n",
        ] {
            to_server
                .unbounded_send(Ok(Bytes::copy_from_slice(line.as_bytes())))
                .unwrap();
        }

        let seen = collect_until(&mut from_server, "third-3").await;
        let first = seen.find("first-1").unwrap();
        let second = seen.find("second-2").unwrap();
        let third = seen.find("third-3").unwrap();
        assert!(first < second && second < third);

        drop(to_server);
        let termination = task.await.unwrap();
        assert_eq!(termination, Termination::SocketClosed);
    }

    #[tokio::test]
    async fn test_concurrent_triggers_clean_up_once() {
        let gate = test_gate(|_| {});
        let mut events = gate.registry().subscribe();
        let session = gate.admit(Some("secret")).await.unwrap();
        let id = session.id();
        let pid = session.pid().unwrap();

        let (to_server, source) = client::unbounded::<Result<Bytes, String>>();
        let (sink, _from_server) = client::unbounded::<Bytes>();
        let task = tokio::spawn(session.run(sink, source));

        // Process exit, socket close and shutdown all at once
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGKILL);
        }
        drop(to_server);
        gate.registry().request_shutdown(&id);

        tokio::time::timeout(Duration::from_secs(10), task)
            .await
            .unwrap()
            .unwrap();
        assert!(gate.registry().is_empty());

        let mut closed = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, SessionEvent::Closed { session_id, .. } if session_id == id) {
                closed += 1;
            }
        }
        assert_eq!(closed, 1);
    }

    #[tokio::test]
    async fn test_teardown_is_idempotent() {
        let gate = test_gate(|_| {});
        let mut session = gate.admit(Some("secret")).await.unwrap();
        let pid = session.pid().unwrap();

        assert!(session.teardown(&Termination::SocketClosed).await);
        assert!(!session.teardown(&Termination::ProcessExited(
            crate::process::ProcessExit::unknown()
        ))
        .await);
        assert_eq!(session.status(), SessionStatus::Closed);
        assert!(!process_alive(pid));
        assert!(gate.registry().is_empty());
    }

    #[tokio::test]
    async fn test_dropped_session_releases_everything() {
        let gate = test_gate(|config| config.limits.max_sessions = 1);
        let session = gate.admit(Some("secret")).await.unwrap();
        let pid = session.pid().unwrap();
        drop(session);

        assert!(gate.registry().is_empty());
        assert!(gate.registry().try_reserve().is_ok());

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while process_alive(pid) && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(!process_alive(pid));
    }

    #[tokio::test]
    async fn test_idle_session_is_closed() {
        let gate = test_gate(|config| config.limits.idle_timeout_secs = 1);
        let session = gate.admit(Some("secret")).await.unwrap();

        let (_to_server, source) = client::unbounded::<Result<Bytes, String>>();
        let (sink, _from_server) = client::unbounded::<Bytes>();

        let termination = tokio::time::timeout(Duration::from_secs(10), session.run(sink, source))
            .await
            .unwrap();
        assert_eq!(termination, Termination::IdleTimeout);
        assert!(gate.registry().is_empty());
    }
}
