//! Connection Gate
//!
//! Entry point for incoming connections. Authorization always happens before
//! anything is spawned; only an authorized connection reaches the Process
//! Adapter.

pub mod auth;

pub use auth::{
    create_authorizer_from_config, Authorizer, DenyAllAuthorizer, Principal,
    StaticTokenAuthorizer,
};

use log::{error, info, warn};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::Notify;

use crate::config::{Config, LimitsConfig, ShellConfig};
use crate::error::{BridgeError, BridgeResult};
use crate::process::{ProcessSpawner, QueuePolicy};
use crate::session::{Session, SessionId, SessionRegistry, SessionState};

pub struct ConnectionGate {
    authorizer: Arc<dyn Authorizer>,
    spawner: Arc<dyn ProcessSpawner>,
    registry: Arc<SessionRegistry>,
    shell: ShellConfig,
    limits: LimitsConfig,
}

impl ConnectionGate {
    pub fn new(
        config: &Config,
        authorizer: Arc<dyn Authorizer>,
        spawner: Arc<dyn ProcessSpawner>,
    ) -> Self {
        Self {
            authorizer,
            spawner,
            registry: Arc::new(SessionRegistry::new(config.limits.max_sessions)),
            shell: config.shell.clone(),
            limits: config.limits.clone(),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Ask the identity collaborator for a decision on this credential
    pub async fn authorize(&self, credential: Option<&str>) -> BridgeResult<Principal> {
        match self.authorizer.authorize(credential).await {
            Some(principal) => Ok(principal),
            None => {
                warn!(
                    "{} authorization refused a connection (credential {})",
                    self.authorizer.auth_type(),
                    if credential.is_some() { "invalid" } else { "missing" }
                );
                Err(BridgeError::Unauthorized)
            }
        }
    }

    /// Create, register and spawn a session for an authorized principal
    pub async fn open_session(&self, principal: Principal) -> BridgeResult<Session> {
        let permit = self.registry.try_reserve()?;

        let id = SessionId::new();
        let state = Arc::new(RwLock::new(SessionState::new(
            id,
            principal.clone(),
            self.registry.event_sender(),
        )));
        let shutdown = Arc::new(Notify::new());
        self.registry.register(state.clone(), shutdown.clone())?;
        let mut pending = PendingSession::new(id, state.clone(), &self.registry);

        let spawner = self.spawner.clone();
        let shell = self.shell.clone();
        let queue = QueuePolicy::from(&self.limits);
        let spawned = tokio::task::spawn_blocking(move || spawner.spawn(&shell, queue))
            .await
            .map_err(|e| BridgeError::Spawn(format!("spawn task failed: {}", e)))
            .and_then(|result| result);

        match spawned {
            Ok(process) => {
                pending.disarm();
                state.write().set_active(process.pid());
                info!(
                    "Session {} active for {} (pid {:?})",
                    id,
                    principal,
                    process.pid()
                );
                Ok(Session::new(
                    state,
                    process,
                    self.registry.clone(),
                    shutdown,
                    permit,
                    &self.limits,
                ))
            }
            Err(e) => {
                error!("Failed to start shell for session {}: {}", id, e);
                pending.abandon(e.to_string());
                Err(e)
            }
        }
    }

    /// Authorize a connection and open its session
    pub async fn admit(&self, credential: Option<&str>) -> BridgeResult<Session> {
        let principal = self.authorize(credential).await?;
        self.open_session(principal).await
    }
}

/// Registry entry of a session whose spawn has not completed yet.
///
/// Dropping it while armed (the connection went away mid-spawn) removes the
/// entry and closes the state.
struct PendingSession<'a> {
    id: SessionId,
    state: Arc<RwLock<SessionState>>,
    registry: &'a SessionRegistry,
    armed: bool,
}

impl<'a> PendingSession<'a> {
    fn new(id: SessionId, state: Arc<RwLock<SessionState>>, registry: &'a SessionRegistry) -> Self {
        Self {
            id,
            state,
            registry,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }

    fn abandon(&mut self, reason: impl Into<String>) {
        if self.armed {
            self.armed = false;
            self.registry.unregister(&self.id);
            self.state.write().set_closed(reason);
        }
    }
}

impl Drop for PendingSession<'_> {
    fn drop(&mut self) {
        self.abandon("connection abandoned during spawn");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProcessHandle;
    use crate::session::SessionStatus;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts spawn attempts and always fails them
    #[derive(Default)]
    struct FailingSpawner {
        calls: AtomicUsize,
    }

    impl ProcessSpawner for FailingSpawner {
        fn spawn(&self, _shell: &ShellConfig, _queue: QueuePolicy) -> BridgeResult<ProcessHandle> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(BridgeError::Spawn("no pty available".to_string()))
        }
    }

    fn gate(spawner: Arc<dyn ProcessSpawner>, max_sessions: usize) -> ConnectionGate {
        let mut config = Config::default();
        config.limits.max_sessions = max_sessions;
        let auth = StaticTokenAuthorizer::default().with_token("secret", "alice");
        ConnectionGate::new(&config, Arc::new(auth), spawner)
    }

    #[tokio::test]
    async fn test_unauthorized_never_spawns() {
        let spawner = Arc::new(FailingSpawner::default());
        let gate = gate(spawner.clone(), 4);

        assert!(matches!(gate.admit(None).await, Err(BridgeError::Unauthorized)));
        assert!(matches!(gate.admit(Some("nope")).await, Err(BridgeError::Unauthorized)));
        assert_eq!(spawner.calls.load(Ordering::SeqCst), 0);
        assert!(gate.registry().is_empty());
    }

    #[tokio::test]
    async fn test_spawn_failure_leaves_nothing_behind() {
        let spawner = Arc::new(FailingSpawner::default());
        let gate = gate(spawner.clone(), 1);
        let mut events = gate.registry().subscribe();

        let result = gate.admit(Some("secret")).await;
        assert!(matches!(result, Err(BridgeError::Spawn(_))));
        assert_eq!(spawner.calls.load(Ordering::SeqCst), 1);
        assert!(gate.registry().is_empty());

        // The capacity slot was returned
        assert!(gate.registry().try_reserve().is_ok());

        let mut saw_closed = false;
        while let Ok(event) = events.try_recv() {
            if let crate::session::SessionEvent::StatusChanged { new_status, .. } = event {
                saw_closed |= new_status == SessionStatus::Closed;
            }
        }
        assert!(saw_closed);
    }

    /// Takes a while before failing, so callers can give up mid-spawn
    struct SlowSpawner;

    impl ProcessSpawner for SlowSpawner {
        fn spawn(&self, _shell: &ShellConfig, _queue: QueuePolicy) -> BridgeResult<ProcessHandle> {
            std::thread::sleep(std::time::Duration::from_millis(300));
            Err(BridgeError::Spawn("too slow".to_string()))
        }
    }

    #[tokio::test]
    async fn test_abandoned_spawn_is_cleaned_up() {
        let gate = gate(Arc::new(SlowSpawner), 1);

        let attempt = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            gate.admit(Some("secret")),
        )
        .await;
        assert!(attempt.is_err());
        assert!(gate.registry().is_empty());
        assert!(gate.registry().try_reserve().is_ok());
    }

    #[tokio::test]
    async fn test_capacity_checked_before_spawn() {
        let spawner = Arc::new(FailingSpawner::default());
        let gate = gate(spawner.clone(), 1);

        let _held = gate.registry().try_reserve().unwrap();
        let result = gate.admit(Some("secret")).await;
        assert!(matches!(result, Err(BridgeError::CapacityExhausted(1))));
        assert_eq!(spawner.calls.load(Ordering::SeqCst), 0);
    }
}
