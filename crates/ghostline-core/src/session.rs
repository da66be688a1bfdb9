//! One shell session: its backend, its command model, and the coordinator
//! task that serialises everything that happens to it.
//!
//! Keystrokes, backend output, oracle answers and `execute` requests all reach
//! the coordinator as messages, so [`CommandState`] is only ever touched from
//! that one task.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::{Backend, BackendEvent};
use crate::command_state::{CommandState, Effect, Suggestion};
use crate::debounce::Debouncer;
use crate::error::{OracleError, SessionError};
use crate::events::{EventSink, OutboundEvent};
use crate::oracle::CompletionRequest;
use crate::settings::GatesReceiver;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
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

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Starting,
    Running,
    Exited,
}

const STARTING: u8 = 0;
const RUNNING: u8 = 1;
const EXITED: u8 = 2;

pub(crate) type Registry = Arc<RwLock<HashMap<SessionId, Arc<SessionHandle>>>>;

pub(crate) type CompletionResult = Result<Option<Suggestion>, OracleError>;

pub(crate) enum SessionCommand {
    Input(String),
    Execute {
        command: String,
        timeout: Duration,
        reply: oneshot::Sender<Result<String, SessionError>>,
    },
    SuggestionReady {
        generation: u64,
        result: CompletionResult,
    },
    Shutdown,
}

/// The manager's view of a session.
pub(crate) struct SessionHandle {
    pub(crate) id: SessionId,
    status: AtomicU8,
    pub(crate) backend: Arc<dyn Backend>,
    commands: mpsc::UnboundedSender<SessionCommand>,
    /// Cancelled on teardown; agent runs bound to the session watch it.
    pub(crate) cancel: CancellationToken,
}

impl SessionHandle {
    pub(crate) fn new(
        id: SessionId,
        backend: Arc<dyn Backend>,
        commands: mpsc::UnboundedSender<SessionCommand>,
    ) -> Self {
        Self {
            id,
            status: AtomicU8::new(STARTING),
            backend,
            commands,
            cancel: CancellationToken::new(),
        }
    }

    pub(crate) fn status(&self) -> SessionStatus {
        match self.status.load(Ordering::Acquire) {
            STARTING => SessionStatus::Starting,
            RUNNING => SessionStatus::Running,
            _ => SessionStatus::Exited,
        }
    }

    pub(crate) fn mark_running(&self) {
        let _ = self
            .status
            .compare_exchange(STARTING, RUNNING, Ordering::AcqRel, Ordering::Acquire);
    }

    /// Moves to `Exited`; returns true only for the caller that made the move.
    fn mark_exited(&self) -> bool {
        self.status.swap(EXITED, Ordering::AcqRel) != EXITED
    }

    pub(crate) fn send(&self, command: SessionCommand) -> bool {
        self.commands.send(command).is_ok()
    }

    /// Releases the backend and stops the coordinator. Runs at most once.
    pub(crate) async fn teardown(&self) -> bool {
        if !self.mark_exited() {
            return false;
        }
        self.cancel.cancel();
        self.backend.kill().await;
        let _ = self.commands.send(SessionCommand::Shutdown);
        true
    }
}

const MARKER_PREFIX: &str = "__GHOSTLINE_END_";

/// Completion marker for one `execute` call.
///
/// The shell is asked to print `__GHOSTLINE_END_<nonce>__`, but the command
/// line spells it as two adjacent quoted strings, so the terminal's echo of
/// the typed line never contains the marker itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Sentinel {
    nonce: String,
}

impl Sentinel {
    pub(crate) fn new() -> Self {
        Self {
            nonce: Uuid::new_v4().simple().to_string(),
        }
    }

    pub(crate) fn marker(&self) -> String {
        format!("{MARKER_PREFIX}{}__", self.nonce)
    }

    fn echoed_form(&self) -> String {
        format!("{MARKER_PREFIX}\"\"{}__", self.nonce)
    }

    pub(crate) fn command_line(&self, command: &str) -> String {
        format!("{command}; echo \"{MARKER_PREFIX}\"\"{}__\"\r", self.nonce)
    }

    /// Returns the command's output once the marker has been printed.
    ///
    /// A terminal may echo the command line more than once (the tty while the
    /// shell is busy, then the line editor after the prompt), so everything up
    /// to the end of the last echoed copy is dropped.
    pub(crate) fn extract(&self, accumulated: &str) -> Option<String> {
        let end = accumulated.find(&self.marker())?;
        let mut output = &accumulated[..end];
        if let Some(pos) = output.rfind(&self.echoed_form()) {
            output = match output[pos..].find('\n') {
                Some(newline) => strip_leading_controls(&output[pos + newline + 1..]),
                None => "",
            };
        }
        Some(output.trim().to_string())
    }
}

/// Skips carriage returns and CSI sequences (such as bash's `ESC[?2004l`)
/// that a line editor prints right after accepting a line.
fn strip_leading_controls(mut text: &str) -> &str {
    loop {
        if let Some(rest) = text.strip_prefix('\r') {
            text = rest;
        } else if let Some(rest) = text.strip_prefix("\x1b[") {
            match rest.find(|c: char| ('\x40'..='\x7e').contains(&c)) {
                Some(end) => text = &rest[end + 1..],
                None => return "",
            }
        } else {
            return text;
        }
    }
}

/// Decodes a byte stream chunk by chunk without splitting multi-byte
/// characters across chunk boundaries.
#[derive(Debug, Default)]
pub(crate) struct Utf8Decoder {
    partial: Vec<u8>,
}

impl Utf8Decoder {
    /// Decodes `bytes` after whatever was held back from the previous chunk.
    /// An incomplete trailing character is kept for the next call; invalid
    /// bytes become U+FFFD.
    pub(crate) fn decode(&mut self, bytes: &[u8]) -> String {
        self.partial.extend_from_slice(bytes);
        let mut text = String::with_capacity(self.partial.len());
        let mut rest: &[u8] = &self.partial;
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    text.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    text.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(len) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }
        let held_back = rest.to_vec();
        self.partial = held_back;
        text
    }
}

struct PendingExecution {
    sentinel: Sentinel,
    output: String,
    deadline: Instant,
    timeout: Duration,
    reply: oneshot::Sender<Result<String, SessionError>>,
}

/// Per-session event loop. Owns the session's [`CommandState`].
pub(crate) struct Coordinator {
    id: SessionId,
    state: CommandState,
    backend: Arc<dyn Backend>,
    backend_events: mpsc::UnboundedReceiver<BackendEvent>,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    commands_tx: mpsc::UnboundedSender<SessionCommand>,
    completions: Debouncer<CompletionRequest, CompletionResult>,
    events: EventSink,
    gates: GatesReceiver,
    registry: Registry,
    decoder: Utf8Decoder,
    pending: Option<PendingExecution>,
}

pub(crate) struct CoordinatorParts {
    pub(crate) id: SessionId,
    pub(crate) state: CommandState,
    pub(crate) backend: Arc<dyn Backend>,
    pub(crate) backend_events: mpsc::UnboundedReceiver<BackendEvent>,
    pub(crate) commands: mpsc::UnboundedReceiver<SessionCommand>,
    pub(crate) commands_tx: mpsc::UnboundedSender<SessionCommand>,
    pub(crate) completions: Debouncer<CompletionRequest, CompletionResult>,
    pub(crate) events: EventSink,
    pub(crate) gates: GatesReceiver,
    pub(crate) registry: Registry,
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl Coordinator {
    pub(crate) fn new(parts: CoordinatorParts) -> Self {
        Self {
            id: parts.id,
            state: parts.state,
            backend: parts.backend,
            backend_events: parts.backend_events,
            commands: parts.commands,
            commands_tx: parts.commands_tx,
            completions: parts.completions,
            events: parts.events,
            gates: parts.gates,
            registry: parts.registry,
            decoder: Utf8Decoder::default(),
            pending: None,
        }
    }

    pub(crate) async fn run(mut self) {
        debug!(session_id = %self.id, "session coordinator started");
        loop {
            let deadline = self.pending.as_ref().map(|p| p.deadline);
            tokio::select! {
                event = self.backend_events.recv() => match event {
                    Some(BackendEvent::Data(bytes)) => self.on_output(&bytes),
                    Some(BackendEvent::Exit(code)) => {
                        self.on_backend_exit(code).await;
                        break;
                    }
                    None => {
                        self.on_backend_exit(None).await;
                        break;
                    }
                },
                command = self.commands.recv() => match command {
                    Some(SessionCommand::Input(data)) => self.on_input(data).await,
                    Some(SessionCommand::Execute { command, timeout, reply }) => {
                        self.start_execution(command, timeout, reply).await;
                    }
                    Some(SessionCommand::SuggestionReady { generation, result }) => {
                        self.on_suggestion(generation, result);
                    }
                    Some(SessionCommand::Shutdown) | None => break,
                },
                _ = sleep_until_deadline(deadline) => self.expire_execution(),
            }
        }

        if let Some(pending) = self.pending.take() {
            let _ = pending.reply.send(Err(SessionError::BackendExited));
        }
        debug!(session_id = %self.id, "session coordinator stopped");
    }

    fn emit(&self, event: OutboundEvent) {
        let _ = self.events.send(event);
    }

    fn on_output(&mut self, bytes: &[u8]) {
        let data = self.decoder.decode(bytes);
        if data.is_empty() {
            return;
        }
        self.emit(OutboundEvent::Output {
            session_id: self.id,
            data: data.clone(),
        });

        let Some(pending) = self.pending.as_mut() else {
            return;
        };
        pending.output.push_str(&data);
        if let Some(output) = pending.sentinel.extract(&pending.output) {
            if let Some(pending) = self.pending.take() {
                debug!(session_id = %self.id, output_len = output.len(), "command completed");
                let _ = pending.reply.send(Ok(output));
            }
        }
    }

    async fn on_input(&mut self, data: String) {
        if let Err(e) = self.backend.write(data.as_bytes()).await {
            warn!(session_id = %self.id, error = %e, "failed to forward input");
            self.emit(OutboundEvent::inline_error(self.id, &e));
        }

        let effect = self.state.handle_input(&data);
        self.apply(effect);
    }

    fn on_suggestion(&mut self, generation: u64, result: CompletionResult) {
        let answer = match result {
            Ok(answer) => answer,
            Err(e) => {
                warn!(session_id = %self.id, error = %e, "suggestion request failed");
                None
            }
        };
        let effect = self.state.resolve_suggestion(generation, answer);
        self.apply(effect);
    }

    fn apply(&mut self, effect: Effect) {
        match effect {
            Effect::Unchanged => {}
            Effect::Publish(suggestion) => self.emit(OutboundEvent::Suggestion {
                session_id: self.id,
                suggestion,
            }),
            Effect::Query(query) => {
                if !self.gates.borrow().suggestions_enabled {
                    if query.cleared {
                        self.emit(OutboundEvent::Suggestion {
                            session_id: self.id,
                            suggestion: None,
                        });
                    }
                    return;
                }
                let answer = self.completions.call(query.request);
                let commands = self.commands_tx.clone();
                let generation = query.generation;
                tokio::spawn(async move {
                    // Cancelled means the session shut down; nothing to deliver.
                    if let Ok(result) = answer.await {
                        let _ = commands.send(SessionCommand::SuggestionReady { generation, result });
                    }
                });
            }
        }
    }

    async fn start_execution(
        &mut self,
        command: String,
        timeout: Duration,
        reply: oneshot::Sender<Result<String, SessionError>>,
    ) {
        if self.pending.is_some() {
            let _ = reply.send(Err(SessionError::Busy(self.id)));
            return;
        }

        let sentinel = Sentinel::new();
        let line = sentinel.command_line(&command);
        if let Err(e) = self.backend.write(line.as_bytes()).await {
            let _ = reply.send(Err(e));
            return;
        }

        info!(session_id = %self.id, command = %command, "executing command");
        self.pending = Some(PendingExecution {
            sentinel,
            output: String::new(),
            deadline: Instant::now() + timeout,
            timeout,
            reply,
        });
    }

    fn expire_execution(&mut self) {
        if let Some(pending) = self.pending.take() {
            warn!(session_id = %self.id, timeout = ?pending.timeout, "command did not complete in time");
            let _ = pending
                .reply
                .send(Err(SessionError::SentinelTimeout(pending.timeout)));
        }
    }

    async fn on_backend_exit(&mut self, exit_code: Option<i32>) {
        let removed = self.registry.write().await.remove(&self.id);
        // `None` means an explicit close already removed and tore down the session.
        if let Some(handle) = removed {
            if handle.teardown().await {
                info!(session_id = %self.id, exit_code = ?exit_code, "shell exited");
                self.emit(OutboundEvent::Exited {
                    session_id: self.id,
                    exit_code,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_round_trips_through_string() {
        let id = SessionId::new();
        let parsed: SessionId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn command_line_does_not_contain_marker() {
        let sentinel = Sentinel::new();
        let line = sentinel.command_line("ls");
        assert!(line.starts_with("ls; echo "));
        assert!(line.ends_with('\r'));
        assert!(!line.contains(&sentinel.marker()));
    }

    #[test]
    fn extract_waits_for_marker() {
        let sentinel = Sentinel::new();
        assert_eq!(sentinel.extract("hi\r\n"), None);
    }

    #[test]
    fn extract_strips_echo_and_marker() {
        let sentinel = Sentinel::new();
        let line = sentinel.command_line("echo hi");
        let accumulated = format!(
            "{}\r\nhi\r\n{}\r\n$ ",
            line.trim_end(),
            sentinel.marker()
        );
        assert_eq!(sentinel.extract(&accumulated), Some("hi".to_string()));
    }

    #[test]
    fn extract_without_echo_returns_everything_before_marker() {
        let sentinel = Sentinel::new();
        let accumulated = format!("  /home/user\r\n{}", sentinel.marker());
        assert_eq!(sentinel.extract(&accumulated), Some("/home/user".to_string()));
    }

    #[test]
    fn extract_cuts_through_the_last_echo() {
        let sentinel = Sentinel::new();
        let typed = sentinel.command_line("echo hi");
        let typed = typed.trim_end();
        let accumulated = format!(
            "{typed}\r\n\x1b[?2004huser@host:~$ {typed}\r\n\x1b[?2004l\rhi\r\n{}\r\n",
            sentinel.marker()
        );
        assert_eq!(sentinel.extract(&accumulated), Some("hi".to_string()));
    }

    #[test]
    fn decoder_joins_character_split_across_chunks() {
        let mut decoder = Utf8Decoder::default();
        assert_eq!(decoder.decode(b"caf\xC3"), "caf");
        assert_eq!(decoder.decode(b"\xA9!"), "é!");
    }

    #[test]
    fn decoder_replaces_invalid_bytes_and_keeps_going() {
        let mut decoder = Utf8Decoder::default();
        assert_eq!(decoder.decode(b"a\xFFb"), "a\u{FFFD}b");
        assert_eq!(decoder.decode(b"\xE2\x82"), "");
        assert_eq!(decoder.decode(b"\xAC"), "€");
    }

    #[test]
    fn markers_are_unique_per_execution() {
        assert_ne!(Sentinel::new().marker(), Sentinel::new().marker());
    }

    #[tokio::test]
    async fn teardown_runs_once() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let backend = crate::test_support::FakeBackend::detached();
        let handle = SessionHandle::new(SessionId::new(), backend.clone(), tx);
        handle.mark_running();
        assert_eq!(handle.status(), SessionStatus::Running);

        assert!(handle.teardown().await);
        assert!(!handle.teardown().await);
        assert_eq!(handle.status(), SessionStatus::Exited);
        assert!(handle.cancel.is_cancelled());
        assert_eq!(backend.kill_count(), 1);
    }
}
