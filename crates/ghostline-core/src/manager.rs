//! The Session Manager: a registry of live sessions keyed by [`SessionId`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::{BackendSpawner, SpawnOptions};
use crate::command_state::CommandState;
use crate::config::SessionConfig;
use crate::debounce::Debouncer;
use crate::error::SessionError;
use crate::events::{EventSink, OutboundEvent};
use crate::history::{load_shell_history, CommandHistory};
use crate::oracle::{CompletionOracle, CompletionRequest};
use crate::session::{
    Coordinator, CoordinatorParts, Registry, SessionCommand, SessionHandle, SessionId, SessionStatus,
};
use crate::settings::{Gates, GatesReceiver};

struct ManagerInner {
    registry: Registry,
    spawner: Arc<dyn BackendSpawner>,
    completion: Arc<dyn CompletionOracle>,
    events: EventSink,
    gates: GatesReceiver,
    config: SessionConfig,
}

/// Owns every live session. Cheap to clone; clones share the registry.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

impl SessionManager {
    pub fn new(
        config: SessionConfig,
        spawner: Arc<dyn BackendSpawner>,
        completion: Arc<dyn CompletionOracle>,
        gates: GatesReceiver,
        events: EventSink,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                registry: Arc::new(RwLock::new(HashMap::new())),
                spawner,
                completion,
                events,
                gates,
                config,
            }),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn gates(&self) -> Gates {
        *self.inner.gates.borrow()
    }

    pub fn events(&self) -> &EventSink {
        &self.inner.events
    }

    /// Spawns a backend and registers a new session for it.
    ///
    /// On failure the error is also written into the output stream under the
    /// would-be session id, and nothing is registered.
    pub async fn create_session(&self) -> Result<SessionId, SessionError> {
        self.create_session_with_id(SessionId::new()).await
    }

    /// Like [`create_session`](Self::create_session), for callers that need
    /// to know the id before the first event is emitted. `id` must be fresh.
    pub async fn create_session_with_id(&self, id: SessionId) -> Result<SessionId, SessionError> {
        let config = &self.inner.config;
        let options = SpawnOptions {
            shell: config.shell_path(),
            cols: config.cols,
            rows: config.rows,
            cwd: config.working_dir(),
            env: Vec::new(),
        };

        let spawned = match self.inner.spawner.spawn(&options) {
            Ok(spawned) => spawned,
            Err(e) => {
                error!(session_id = %id, shell = %options.shell, error = %e, "failed to start session");
                let _ = self.inner.events.send(OutboundEvent::inline_error(id, &e));
                return Err(e);
            }
        };

        let history = if config.seed_history {
            load_shell_history(&options.shell, config.history_capacity)
        } else {
            CommandHistory::new(config.history_capacity)
        };

        let (commands_tx, commands) = mpsc::unbounded_channel();
        let handle = Arc::new(SessionHandle::new(
            id,
            Arc::clone(&spawned.handle),
            commands_tx.clone(),
        ));

        let oracle = Arc::clone(&self.inner.completion);
        let completions = Debouncer::new(config.debounce(), move |request: CompletionRequest| {
            let oracle = Arc::clone(&oracle);
            async move { oracle.complete(&request).await }
        });

        // Register before the coordinator starts so an immediate exit finds the entry.
        self.inner.registry.write().await.insert(id, Arc::clone(&handle));

        let coordinator = Coordinator::new(CoordinatorParts {
            id,
            state: CommandState::new(history),
            backend: spawned.handle,
            backend_events: spawned.events,
            commands,
            commands_tx,
            completions,
            events: self.inner.events.clone(),
            gates: self.inner.gates.clone(),
            registry: Arc::clone(&self.inner.registry),
        });
        tokio::spawn(coordinator.run());
        handle.mark_running();

        info!(session_id = %id, shell = %options.shell, "session started");
        Ok(id)
    }

    async fn handle(&self, id: SessionId) -> Option<Arc<SessionHandle>> {
        self.inner.registry.read().await.get(&id).cloned()
    }

    /// Forwards raw input to the session. Unknown or exited sessions are ignored.
    pub async fn write(&self, id: SessionId, data: impl Into<String>) {
        let Some(handle) = self.handle(id).await else {
            debug!(session_id = %id, "input for unknown session dropped");
            return;
        };
        if handle.status() != SessionStatus::Running {
            return;
        }
        handle.send(SessionCommand::Input(data.into()));
    }

    /// Resizes one session, or every session when `id` is `None`.
    pub async fn resize(&self, id: Option<SessionId>, cols: u16, rows: u16) {
        let targets: Vec<Arc<SessionHandle>> = {
            let registry = self.inner.registry.read().await;
            match id {
                Some(id) => registry.get(&id).cloned().into_iter().collect(),
                None => registry.values().cloned().collect(),
            }
        };

        for handle in targets {
            if let Err(e) = handle.backend.resize(cols, rows).await {
                warn!(session_id = %handle.id, error = %e, "failed to resize terminal");
            }
        }
    }

    /// Tears the session down. Closing an unknown or already-closed session is a no-op.
    pub async fn close(&self, id: SessionId) {
        let removed = self.inner.registry.write().await.remove(&id);
        if let Some(handle) = removed {
            if handle.teardown().await {
                info!(session_id = %id, "session closed");
            }
        }
    }

    pub async fn close_all(&self) {
        let handles: Vec<Arc<SessionHandle>> = {
            let mut registry = self.inner.registry.write().await;
            registry.drain().map(|(_, handle)| handle).collect()
        };
        let count = handles.len();
        for handle in handles {
            handle.teardown().await;
        }
        if count > 0 {
            info!(count, "closed all sessions");
        }
    }

    /// Runs `command` in the session's shell and returns what it printed.
    ///
    /// Completion is detected with a one-off marker echoed after the command.
    /// `timeout` defaults to the configured execute timeout.
    pub async fn execute(
        &self,
        id: SessionId,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<String, SessionError> {
        let handle = self.handle(id).await.ok_or(SessionError::NotFound(id))?;
        if handle.status() != SessionStatus::Running {
            return Err(SessionError::NotRunning(id));
        }

        let (reply, answer) = oneshot::channel();
        let sent = handle.send(SessionCommand::Execute {
            command: command.to_string(),
            timeout: timeout.unwrap_or_else(|| self.inner.config.execute_timeout()),
            reply,
        });
        if !sent {
            return Err(SessionError::BackendExited);
        }
        answer.await.unwrap_or(Err(SessionError::BackendExited))
    }

    pub async fn status(&self, id: SessionId) -> Option<SessionStatus> {
        self.handle(id).await.map(|handle| handle.status())
    }

    pub async fn contains(&self, id: SessionId) -> bool {
        self.inner.registry.read().await.contains_key(&id)
    }

    pub async fn session_ids(&self) -> Vec<SessionId> {
        self.inner.registry.read().await.keys().copied().collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.registry.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.registry.read().await.is_empty()
    }

    /// Token cancelled when the session is torn down.
    pub async fn cancellation(&self, id: SessionId) -> Option<CancellationToken> {
        self.handle(id).await.map(|handle| handle.cancel.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_state::Suggestion;
    use crate::error::OracleError;
    use crate::events::EventStream;
    use crate::test_support::{harness, FakeSpawner, Harness, ScriptedCompletion};
    use std::time::Duration;
    use tokio::time::timeout;

    async fn next_suggestion(events: &mut EventStream) -> Option<Suggestion> {
        loop {
            let event = timeout(Duration::from_secs(5), events.recv())
                .await
                .expect("timed out waiting for a suggestion")
                .expect("event stream closed");
            if let OutboundEvent::Suggestion { suggestion, .. } = event {
                return suggestion;
            }
        }
    }

    async fn next_exit(events: &mut EventStream) -> (SessionId, Option<i32>) {
        loop {
            let event = timeout(Duration::from_secs(5), events.recv())
                .await
                .expect("timed out waiting for exit")
                .expect("event stream closed");
            if let OutboundEvent::Exited {
                session_id,
                exit_code,
            } = event
            {
                return (session_id, exit_code);
            }
        }
    }

    fn ls_la() -> Suggestion {
        Suggestion {
            full_command: "ls -la".into(),
            next_portion: "s -la".into(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn create_registers_running_session() {
        let Harness { manager, spawner, .. } = harness(FakeSpawner::new(), ScriptedCompletion::new(), true);
        let id = manager.create_session().await.unwrap();

        assert!(manager.contains(id).await);
        assert_eq!(manager.status(id).await, Some(SessionStatus::Running));
        assert_eq!(spawner.spawned().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn spawn_failure_reports_inline_and_registers_nothing() {
        let Harness {
            manager, mut events, ..
        } = harness(FakeSpawner::failing(), ScriptedCompletion::new(), true);

        let err = manager.create_session().await.unwrap_err();
        assert!(matches!(err, SessionError::Spawn(_)));
        assert!(manager.is_empty().await);

        match events.recv().await {
            Some(OutboundEvent::Output { data, .. }) => assert!(data.contains("[Error:")),
            other => panic!("expected inline error, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn write_forwards_bytes_verbatim() {
        let Harness { manager, spawner, .. } = harness(FakeSpawner::new(), ScriptedCompletion::new(), false);
        let id = manager.create_session().await.unwrap();

        manager.write(id, "l").await;
        manager.write(id, "\x1b[A").await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(spawner.spawned()[0].writes(), vec!["l".to_string(), "\x1b[A".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn close_twice_kills_once() {
        let Harness { manager, spawner, .. } = harness(FakeSpawner::new(), ScriptedCompletion::new(), false);
        let id = manager.create_session().await.unwrap();

        manager.close(id).await;
        manager.close(id).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(!manager.contains(id).await);
        assert_eq!(spawner.spawned()[0].kill_count(), 1);

        manager.write(id, "ls\r").await;
        assert!(spawner.spawned()[0].writes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_close_does_not_emit_exited() {
        let Harness {
            manager, mut events, ..
        } = harness(FakeSpawner::new(), ScriptedCompletion::new(), false);
        let id = manager.create_session().await.unwrap();

        manager.close(id).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        while let Ok(event) = events.try_recv() {
            assert!(!matches!(event, OutboundEvent::Exited { .. }), "unexpected {event:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn backend_exit_removes_session_and_emits_exited() {
        let Harness {
            manager,
            spawner,
            mut events,
            ..
        } = harness(FakeSpawner::new(), ScriptedCompletion::new(), false);
        let id = manager.create_session().await.unwrap();

        spawner.spawned()[0].exit(3);
        let (exited, code) = next_exit(&mut events).await;

        assert_eq!(exited, id);
        assert_eq!(code, Some(3));
        assert!(!manager.contains(id).await);
        assert_eq!(spawner.spawned()[0].kill_count(), 1);

        manager.close(id).await;
        assert_eq!(spawner.spawned()[0].kill_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn close_all_tears_down_every_session() {
        let Harness { manager, spawner, .. } = harness(FakeSpawner::new(), ScriptedCompletion::new(), false);
        manager.create_session().await.unwrap();
        manager.create_session().await.unwrap();

        manager.close_all().await;

        assert!(manager.is_empty().await);
        assert!(spawner.spawned().iter().all(|backend| backend.kill_count() == 1));
    }

    #[tokio::test(start_paused = true)]
    async fn resize_without_id_targets_all_sessions() {
        let Harness { manager, spawner, .. } = harness(FakeSpawner::new(), ScriptedCompletion::new(), false);
        let first = manager.create_session().await.unwrap();
        manager.create_session().await.unwrap();

        manager.resize(None, 120, 40).await;
        manager.resize(Some(first), 100, 30).await;
        manager.resize(Some(SessionId::new()), 1, 1).await;

        let backends = spawner.spawned();
        let sizes: Vec<Vec<(u16, u16)>> = backends.iter().map(|b| b.sizes()).collect();
        assert!(sizes.contains(&vec![(120, 40), (100, 30)]));
        assert!(sizes.contains(&vec![(120, 40)]));
    }

    #[tokio::test(start_paused = true)]
    async fn typed_prefix_gets_debounced_suggestion() {
        let oracle = ScriptedCompletion::new();
        oracle.push(Ok(Some(ls_la())));
        let Harness {
            manager,
            oracle,
            mut events,
            ..
        } = harness(FakeSpawner::new(), oracle, true);
        let id = manager.create_session().await.unwrap();

        manager.write(id, "l").await;
        assert_eq!(next_suggestion(&mut events).await, Some(ls_la()));

        let requests = oracle.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].partial, "l");

        // Typing along the suggestion shrinks it without another request.
        manager.write(id, "s").await;
        assert_eq!(
            next_suggestion(&mut events).await,
            Some(Suggestion {
                full_command: "ls -la".into(),
                next_portion: " -la".into(),
            })
        );
        assert_eq!(oracle.requests().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn burst_of_keystrokes_queries_once() {
        let oracle = ScriptedCompletion::new();
        oracle.push(Ok(Some(Suggestion {
            full_command: "git status".into(),
            next_portion: "status".into(),
        })));
        let Harness {
            manager,
            oracle,
            mut events,
            ..
        } = harness(FakeSpawner::new(), oracle, true);
        let id = manager.create_session().await.unwrap();

        for key in ["g", "i", "t", " "] {
            manager.write(id, key).await;
        }
        let suggestion = next_suggestion(&mut events).await.unwrap();

        assert_eq!(suggestion.next_portion, "status");
        let requests = oracle.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].partial, "git ");
    }

    #[tokio::test(start_paused = true)]
    async fn oracle_failure_clears_suggestion_and_session_survives() {
        let oracle = ScriptedCompletion::new();
        oracle.push(Err(OracleError::Timeout));
        oracle.push(Ok(Some(ls_la())));
        let Harness {
            manager,
            oracle,
            mut events,
            ..
        } = harness(FakeSpawner::new(), oracle, true);
        let id = manager.create_session().await.unwrap();

        manager.write(id, "x").await;
        assert_eq!(next_suggestion(&mut events).await, None);
        assert_eq!(oracle.requests().len(), 1);

        manager.write(id, "\x7f").await;
        manager.write(id, "l").await;
        assert_eq!(next_suggestion(&mut events).await, Some(ls_la()));
    }

    #[tokio::test(start_paused = true)]
    async fn suggestions_gate_off_skips_oracle() {
        let Harness { manager, oracle, .. } = harness(FakeSpawner::new(), ScriptedCompletion::new(), false);
        let id = manager.create_session().await.unwrap();

        manager.write(id, "l").await;
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(oracle.requests().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn gate_change_applies_to_running_sessions() {
        let oracle = ScriptedCompletion::new();
        oracle.push(Ok(Some(ls_la())));
        let Harness {
            manager,
            oracle,
            gates,
            mut events,
            ..
        } = harness(FakeSpawner::new(), oracle, false);
        let id = manager.create_session().await.unwrap();

        gates.send_modify(|gates| gates.suggestions_enabled = true);
        manager.write(id, "l").await;

        assert_eq!(next_suggestion(&mut events).await, Some(ls_la()));
        assert_eq!(oracle.requests().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn turning_suggestions_off_retracts_live_suggestion() {
        let oracle = ScriptedCompletion::new();
        oracle.push(Ok(Some(ls_la())));
        let Harness {
            manager,
            oracle,
            gates,
            mut events,
            ..
        } = harness(FakeSpawner::new(), oracle, true);
        let id = manager.create_session().await.unwrap();

        manager.write(id, "l").await;
        assert_eq!(next_suggestion(&mut events).await, Some(ls_la()));

        gates.send_modify(|gates| gates.suggestions_enabled = false);
        manager.write(id, "x").await;

        assert_eq!(next_suggestion(&mut events).await, None);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(oracle.requests().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn execute_returns_command_output() {
        let Harness { manager, .. } = harness(FakeSpawner::new(), ScriptedCompletion::new(), false);
        let id = manager.create_session().await.unwrap();

        let output = manager.execute(id, "echo hi", None).await.unwrap();
        assert_eq!(output, "hi");
    }

    #[tokio::test(start_paused = true)]
    async fn execute_output_is_also_streamed() {
        let Harness {
            manager, mut events, ..
        } = harness(FakeSpawner::new(), ScriptedCompletion::new(), false);
        let id = manager.create_session().await.unwrap();

        manager.execute(id, "echo hi", None).await.unwrap();

        let mut streamed = String::new();
        while let Ok(event) = events.try_recv() {
            if let OutboundEvent::Output { data, .. } = event {
                streamed.push_str(&data);
            }
        }
        assert!(streamed.contains("hi\r\n"));
    }

    #[tokio::test(start_paused = true)]
    async fn execute_skips_every_echo_of_the_command_line() {
        let Harness { manager, .. } = harness(FakeSpawner::line_editor(), ScriptedCompletion::new(), false);
        let id = manager.create_session().await.unwrap();

        let output = manager.execute(id, "echo hi", None).await.unwrap();
        assert_eq!(output, "hi");
    }

    #[tokio::test(start_paused = true)]
    async fn characters_split_across_reads_survive() {
        let Harness {
            manager,
            spawner,
            mut events,
            ..
        } = harness(FakeSpawner::mute(), ScriptedCompletion::new(), false);
        let id = manager.create_session().await.unwrap();

        let running = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.execute(id, "cat menu", None).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let backend = spawner.spawned()[0].clone();
        let marker = backend.last_marker().unwrap();
        backend.emit_bytes(b"caf\xC3");
        backend.emit_bytes(b"\xA9\r\n");
        backend.emit_bytes(format!("{marker}\r\n").as_bytes());

        assert_eq!(running.await.unwrap().unwrap(), "café");

        let mut streamed = String::new();
        while let Ok(event) = events.try_recv() {
            if let OutboundEvent::Output { data, .. } = event {
                streamed.push_str(&data);
            }
        }
        assert!(streamed.contains("café\r\n"));
        assert!(!streamed.contains(char::REPLACEMENT_CHARACTER));
    }

    #[tokio::test(start_paused = true)]
    async fn execute_times_out_without_marker() {
        let Harness { manager, .. } = harness(FakeSpawner::mute(), ScriptedCompletion::new(), false);
        let id = manager.create_session().await.unwrap();

        let err = manager
            .execute(id, "sleep 100", Some(Duration::from_secs(2)))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::SentinelTimeout(d) if d == Duration::from_secs(2)));

        // The session is still usable afterwards.
        assert!(manager.contains(id).await);
    }

    #[tokio::test(start_paused = true)]
    async fn execute_fails_when_backend_exits() {
        let Harness { manager, spawner, .. } = harness(FakeSpawner::mute(), ScriptedCompletion::new(), false);
        let id = manager.create_session().await.unwrap();

        let running = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.execute(id, "exit", None).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        spawner.spawned()[0].exit(0);

        let err = running.await.unwrap().unwrap_err();
        assert!(matches!(err, SessionError::BackendExited));
    }

    #[tokio::test(start_paused = true)]
    async fn execute_on_unknown_session_is_not_found() {
        let Harness { manager, .. } = harness(FakeSpawner::new(), ScriptedCompletion::new(), false);
        let id = SessionId::new();

        let err = manager.execute(id, "pwd", None).await.unwrap_err();
        assert!(matches!(err, SessionError::NotFound(missing) if missing == id));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_execute_is_rejected() {
        let Harness { manager, .. } = harness(FakeSpawner::mute(), ScriptedCompletion::new(), false);
        let id = manager.create_session().await.unwrap();

        let first = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.execute(id, "sleep 5", Some(Duration::from_secs(1))).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let err = manager.execute(id, "pwd", None).await.unwrap_err();
        assert!(matches!(err, SessionError::Busy(_)));
        assert!(matches!(
            first.await.unwrap(),
            Err(SessionError::SentinelTimeout(_))
        ));
    }
}
