use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use ghostline_core::{
    AgentLoop, EventStream, Gates, GatesUpdate, OutboundEvent, SessionError, SessionId, SessionManager,
};
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::FileConfig;
use crate::protocol::{to_line, Event};

/// Unique client identifier
pub type ClientId = u64;

/// Channel for sending events to a client
pub type ClientSender = mpsc::UnboundedSender<String>;

/// Daemon-wide shared state
pub struct DaemonState {
    /// Token for authentication (None if auth disabled)
    pub token: Option<String>,

    pub manager: SessionManager,

    /// None when no oracle API key is configured.
    pub agent: Option<Arc<AgentLoop>>,

    /// Session ownership (SessionId → ClientId)
    pub session_owners: RwLock<HashMap<SessionId, ClientId>>,

    /// Client event senders (ClientId → sender)
    pub clients: RwLock<HashMap<ClientId, ClientSender>>,

    /// Next client ID counter
    next_client_id: Mutex<ClientId>,

    gates: watch::Sender<Gates>,

    /// The config as read from disk, rewritten when settings change.
    file_config: Mutex<FileConfig>,
    config_path: PathBuf,
}

impl DaemonState {
    pub fn new(
        token: Option<String>,
        manager: SessionManager,
        agent: Option<Arc<AgentLoop>>,
        gates: watch::Sender<Gates>,
        file_config: FileConfig,
        config_path: PathBuf,
    ) -> Self {
        Self {
            token,
            manager,
            agent,
            session_owners: RwLock::new(HashMap::new()),
            clients: RwLock::new(HashMap::new()),
            next_client_id: Mutex::new(1),
            gates,
            file_config: Mutex::new(file_config),
            config_path,
        }
    }

    /// Register a new client, returning its ID and event receiver
    pub async fn register_client(&self) -> (ClientId, mpsc::UnboundedReceiver<String>) {
        let mut id = self.next_client_id.lock().await;
        let client_id = *id;
        *id += 1;

        let (tx, rx) = mpsc::unbounded_channel();
        self.clients.write().await.insert(client_id, tx);

        (client_id, rx)
    }

    /// Unregister a client and close every session it owns
    pub async fn unregister_client(&self, client_id: ClientId) {
        self.clients.write().await.remove(&client_id);

        let owned: Vec<SessionId> = {
            let mut owners = self.session_owners.write().await;
            let owned: Vec<SessionId> = owners
                .iter()
                .filter(|(_, &owner)| owner == client_id)
                .map(|(id, _)| *id)
                .collect();
            for id in &owned {
                owners.remove(id);
            }
            owned
        };

        if !owned.is_empty() {
            info!(client_id, count = owned.len(), "closing sessions of disconnected client");
        }
        for id in owned {
            self.manager.close(id).await;
        }
    }

    /// Creates a session owned by `owner`.
    ///
    /// The owner table stays write-locked until the session is recorded, so
    /// the event forwarder cannot see the session's first output before it
    /// knows where to send it. A spawn failure never gets an owner, so its
    /// inline error goes straight to the requesting client.
    pub async fn create_session(&self, owner: ClientId) -> Result<SessionId, SessionError> {
        let mut owners = self.session_owners.write().await;
        let id = SessionId::new();
        match self.manager.create_session_with_id(id).await {
            Ok(id) => {
                owners.insert(id, owner);
                Ok(id)
            }
            Err(e) => {
                drop(owners);
                let line = to_line(&Event::from_outbound(&OutboundEvent::inline_error(id, &e)));
                self.send_to_client(owner, line).await;
                Err(e)
            }
        }
    }

    pub async fn close_session(&self, id: SessionId) {
        self.session_owners.write().await.remove(&id);
        self.manager.close(id).await;
    }

    /// Send an event to a specific client
    pub async fn send_to_client(&self, client_id: ClientId, msg: String) {
        if let Some(tx) = self.clients.read().await.get(&client_id) {
            let _ = tx.send(msg);
        }
    }

    /// Routes core events to the client that owns each session. Runs until the
    /// event stream closes.
    pub async fn forward_events(self: Arc<Self>, mut events: EventStream) {
        while let Some(event) = events.recv().await {
            let session_id = event.session_id();
            let owner = if matches!(event, OutboundEvent::Exited { .. }) {
                self.session_owners.write().await.remove(&session_id)
            } else {
                self.session_owners.read().await.get(&session_id).copied()
            };

            match owner {
                Some(client_id) => {
                    let line = to_line(&Event::from_outbound(&event));
                    self.send_to_client(client_id, line).await;
                }
                None => debug!(session_id = %session_id, "dropping event for unowned session"),
            }
        }
        debug!("event stream closed");
    }

    pub fn gates(&self) -> Gates {
        *self.gates.borrow()
    }

    /// Applies a gates change to every session and persists it.
    pub async fn update_gates(&self, update: GatesUpdate) -> Gates {
        let gates = self.gates().apply(update);
        self.gates.send_replace(gates);
        info!(
            suggestions_enabled = gates.suggestions_enabled,
            agent_enabled = gates.agent_enabled,
            "settings updated"
        );

        let mut config = self.file_config.lock().await;
        config.settings = gates;
        if let Err(e) = config.save(&self.config_path) {
            warn!(path = %self.config_path.display(), error = %e, "failed to persist settings");
        }
        gates
    }

    pub async fn shutdown(&self) {
        self.session_owners.write().await.clear();
        self.manager.close_all().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use ghostline_core::test_support::{harness, FakeSpawner, Harness, ScriptedCompletion};
    use serde_json::Value;

    use crate::protocol::{EVENT_TERMINAL_EXITED, EVENT_TERMINAL_OUTPUT};
    use tempfile::TempDir;
    use tokio::time::timeout;

    fn daemon_state(dir: &TempDir, spawner: FakeSpawner) -> (Arc<DaemonState>, Harness) {
        let harness = harness(spawner, ScriptedCompletion::new(), false);
        let (gates, _) = watch::channel(Gates::default());
        let state = Arc::new(DaemonState::new(
            None,
            harness.manager.clone(),
            None,
            gates,
            FileConfig::default(),
            dir.path().join("config.toml"),
        ));
        (state, harness)
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<String>) -> Value {
        let line = timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for an event")
            .expect("client channel closed");
        serde_json::from_str(&line).expect("event is JSON")
    }

    async fn next_event_named(rx: &mut mpsc::UnboundedReceiver<String>, name: &str) -> Value {
        loop {
            let event = next_event(rx).await;
            if event["method"] == name {
                return event;
            }
        }
    }

    #[tokio::test]
    async fn disconnect_closes_only_owned_sessions() {
        let dir = TempDir::new().unwrap();
        let (state, Harness { manager, spawner, .. }) = daemon_state(&dir, FakeSpawner::new());
        let (alice, _alice_rx) = state.register_client().await;
        let (bob, _bob_rx) = state.register_client().await;

        let first = state.create_session(alice).await.unwrap();
        let second = state.create_session(alice).await.unwrap();
        let kept = state.create_session(bob).await.unwrap();

        state.unregister_client(alice).await;

        assert!(!manager.contains(first).await);
        assert!(!manager.contains(second).await);
        assert!(manager.contains(kept).await);
        let kills: Vec<usize> = spawner.spawned().iter().map(|b| b.kill_count()).collect();
        assert_eq!(kills, vec![1, 1, 0]);

        let owners = state.session_owners.read().await;
        assert_eq!(owners.len(), 1);
        assert_eq!(owners.get(&kept), Some(&bob));
    }

    #[tokio::test]
    async fn events_reach_only_the_owner() {
        let dir = TempDir::new().unwrap();
        let (state, Harness { manager, spawner, events, .. }) = daemon_state(&dir, FakeSpawner::new());
        tokio::spawn(state.clone().forward_events(events));

        let (alice, mut alice_rx) = state.register_client().await;
        let (bob, mut bob_rx) = state.register_client().await;
        let session = state.create_session(alice).await.unwrap();
        state.create_session(bob).await.unwrap();

        manager.write(session, "ls").await;
        let output = next_event_named(&mut alice_rx, EVENT_TERMINAL_OUTPUT).await;
        assert_eq!(output["params"]["session_id"], session.to_string());
        assert_eq!(output["params"]["data"], "ls");

        spawner.spawned()[0].exit(3);
        let exited = next_event_named(&mut alice_rx, EVENT_TERMINAL_EXITED).await;
        assert_eq!(exited["params"]["session_id"], session.to_string());
        assert_eq!(exited["params"]["exit_code"], 3);

        assert!(!state.session_owners.read().await.contains_key(&session));
        assert!(bob_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn spawn_failure_is_shown_to_the_requesting_client() {
        let dir = TempDir::new().unwrap();
        let (state, Harness { events, .. }) = daemon_state(&dir, FakeSpawner::failing());
        tokio::spawn(state.clone().forward_events(events));
        let (client, mut rx) = state.register_client().await;

        let err = state.create_session(client).await.unwrap_err();
        assert!(matches!(err, SessionError::Spawn(_)));

        let output = next_event(&mut rx).await;
        assert_eq!(output["method"], EVENT_TERMINAL_OUTPUT);
        assert!(output["params"]["data"].as_str().unwrap().contains("[Error:"));
        assert!(state.session_owners.read().await.is_empty());
    }
}
