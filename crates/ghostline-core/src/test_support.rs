//! Fakes shared by the unit tests, and by dependent crates through the
//! `test-support` feature.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use crate::agent::AgentStep;
use crate::backend::{Backend, BackendEvent, BackendSpawner, SpawnOptions, SpawnedBackend};
use crate::command_state::Suggestion;
use crate::config::SessionConfig;
use crate::error::{OracleError, SessionError};
use crate::events::EventStream;
use crate::manager::SessionManager;
use crate::oracle::{AgentMessage, CompletionOracle, CompletionRequest, PlanningOracle};
use crate::settings::Gates;

/// A tiny stand-in for a shell on a terminal.
///
/// Every write is echoed back the way a tty would. Unless muted, a write that
/// ends in `\r` is run as a command line: each `echo` segment prints its
/// arguments with quotes removed; anything else prints nothing. In line
/// editor mode a submitted line is echoed a second time after a prompt, the
/// way bash redraws it once readline gets the line.
pub struct FakeBackend {
    events: mpsc::UnboundedSender<BackendEvent>,
    interpret: bool,
    line_editor: bool,
    writes: Mutex<Vec<String>>,
    sizes: Mutex<Vec<(u16, u16)>>,
    kills: AtomicUsize,
}

impl FakeBackend {
    fn new(interpret: bool, line_editor: bool) -> (Arc<Self>, mpsc::UnboundedReceiver<BackendEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let backend = Arc::new(Self {
            events,
            interpret,
            line_editor,
            writes: Mutex::new(Vec::new()),
            sizes: Mutex::new(Vec::new()),
            kills: AtomicUsize::new(0),
        });
        (backend, rx)
    }

    /// A backend whose events nobody reads.
    pub fn detached() -> Arc<Self> {
        Self::new(false, false).0
    }

    pub fn writes(&self) -> Vec<String> {
        self.writes.lock().unwrap().clone()
    }

    pub fn sizes(&self) -> Vec<(u16, u16)> {
        self.sizes.lock().unwrap().clone()
    }

    pub fn kill_count(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }

    /// Simulates the shell exiting on its own.
    pub fn exit(&self, code: i32) {
        let _ = self.events.send(BackendEvent::Exit(Some(code)));
    }

    /// Delivers raw output, possibly cut in the middle of a character.
    pub fn emit_bytes(&self, bytes: &[u8]) {
        let _ = self.events.send(BackendEvent::Data(bytes.to_vec()));
    }

    fn emit(&self, text: &str) {
        self.emit_bytes(text.as_bytes());
    }

    /// The completion marker of the last command line written, as the shell
    /// would print it.
    pub fn last_marker(&self) -> Option<String> {
        self.writes()
            .iter()
            .rev()
            .find_map(|line| {
                let start = line.find("__GHOSTLINE_END_")?;
                let quoted = line[start..].trim_end_matches(['\r', '"']);
                Some(quoted.replace("\"\"", ""))
            })
    }

    fn run_line(&self, line: &str) {
        for segment in line.split(';').flat_map(|part| part.split("&&")) {
            if let Some(args) = segment.trim().strip_prefix("echo ") {
                self.emit(&format!("{}\r\n", args.trim().replace('"', "")));
            }
        }
    }
}

#[async_trait]
impl Backend for FakeBackend {
    async fn write(&self, data: &[u8]) -> Result<(), SessionError> {
        let text = String::from_utf8_lossy(data).to_string();
        self.writes.lock().unwrap().push(text.clone());

        match text.strip_suffix('\r') {
            Some(line) => {
                self.emit(&format!("{line}\r\n"));
                if self.line_editor {
                    self.emit(&format!("\x1b[?2004h$ {line}\r\n\x1b[?2004l\r"));
                }
                if self.interpret {
                    self.run_line(line);
                }
            }
            None => self.emit(&text),
        }
        Ok(())
    }

    async fn resize(&self, cols: u16, rows: u16) -> Result<(), SessionError> {
        self.sizes.lock().unwrap().push((cols, rows));
        Ok(())
    }

    async fn kill(&self) {
        self.kills.fetch_add(1, Ordering::SeqCst);
        let _ = self.events.send(BackendEvent::Exit(None));
    }
}

pub struct FakeSpawner {
    fail: bool,
    interpret: bool,
    line_editor: bool,
    spawned: Mutex<Vec<Arc<FakeBackend>>>,
}

impl FakeSpawner {
    pub fn new() -> Self {
        Self {
            fail: false,
            interpret: true,
            line_editor: false,
            spawned: Mutex::new(Vec::new()),
        }
    }

    /// Shells that echo each submitted line twice, with a prompt in between.
    pub fn line_editor() -> Self {
        Self {
            line_editor: true,
            ..Self::new()
        }
    }

    /// Shells that never run anything, so `execute` never sees its marker.
    pub fn mute() -> Self {
        Self {
            interpret: false,
            ..Self::new()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new()
        }
    }

    pub fn spawned(&self) -> Vec<Arc<FakeBackend>> {
        self.spawned.lock().unwrap().clone()
    }
}

impl BackendSpawner for FakeSpawner {
    fn spawn(&self, options: &SpawnOptions) -> Result<SpawnedBackend, SessionError> {
        if self.fail {
            return Err(SessionError::Spawn(format!("no such shell: {}", options.shell)));
        }
        let (backend, events) = FakeBackend::new(self.interpret, self.line_editor);
        self.spawned.lock().unwrap().push(Arc::clone(&backend));
        Ok(SpawnedBackend {
            handle: backend,
            events,
        })
    }
}

/// Completion oracle answering from a queue; `Ok(None)` once the queue is empty.
pub struct ScriptedCompletion {
    answers: Mutex<VecDeque<Result<Option<Suggestion>, OracleError>>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedCompletion {
    pub fn new() -> Self {
        Self {
            answers: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, answer: Result<Option<Suggestion>, OracleError>) {
        self.answers.lock().unwrap().push_back(answer);
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl CompletionOracle for ScriptedCompletion {
    async fn complete(&self, request: &CompletionRequest) -> Result<Option<Suggestion>, OracleError> {
        self.requests.lock().unwrap().push(request.clone());
        self.answers.lock().unwrap().pop_front().unwrap_or(Ok(None))
    }
}

/// Planning oracle replaying a fixed list of steps and recording every log it saw.
pub struct ScriptedPlanner {
    steps: Mutex<VecDeque<Result<AgentStep, OracleError>>>,
    logs: Mutex<Vec<Vec<AgentMessage>>>,
}

impl ScriptedPlanner {
    pub fn new(steps: impl IntoIterator<Item = Result<AgentStep, OracleError>>) -> Self {
        Self {
            steps: Mutex::new(steps.into_iter().collect()),
            logs: Mutex::new(Vec::new()),
        }
    }

    pub fn logs(&self) -> Vec<Vec<AgentMessage>> {
        self.logs.lock().unwrap().clone()
    }
}

#[async_trait]
impl PlanningOracle for ScriptedPlanner {
    async fn next_step(&self, log: &[AgentMessage]) -> Result<AgentStep, OracleError> {
        self.logs.lock().unwrap().push(log.to_vec());
        self.steps
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(AgentStep::plan("thinking")))
    }
}

pub struct Harness {
    pub manager: SessionManager,
    pub spawner: Arc<FakeSpawner>,
    pub oracle: Arc<ScriptedCompletion>,
    pub gates: watch::Sender<Gates>,
    pub events: EventStream,
}

pub fn harness(spawner: FakeSpawner, oracle: ScriptedCompletion, suggestions_enabled: bool) -> Harness {
    let spawner = Arc::new(spawner);
    let oracle = Arc::new(oracle);
    let (gates, gates_rx) = watch::channel(Gates {
        suggestions_enabled,
        agent_enabled: true,
    });
    let (events_tx, events) = mpsc::unbounded_channel();
    let config = SessionConfig {
        shell: Some("/bin/sh".into()),
        seed_history: false,
        ..SessionConfig::default()
    };
    let manager = SessionManager::new(config, spawner.clone(), oracle.clone(), gates_rx, events_tx);
    Harness {
        manager,
        spawner,
        oracle,
        gates,
        events,
    }
}
