//! Session multiplexer and input-synchronisation engine for ghostline.
//!
//! A [`SessionManager`] owns N interactive shell sessions. Each session runs a
//! coordinator task that forwards keystrokes to its Process Backend, models the
//! typed command line in a [`CommandState`], and keeps an inline completion
//! suggestion in sync with it. Sessions also expose a sentinel-delimited
//! `execute` primitive which the [`AgentLoop`] uses to drive a shell
//! autonomously.

pub mod agent;
pub mod backend;
pub mod command_state;
pub mod config;
pub mod debounce;
pub mod error;
pub mod events;
pub mod history;
pub mod keys;
pub mod manager;
pub mod oracle;
pub mod pty;
pub mod session;
pub mod settings;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use agent::{run_agent_task, AgentLoop, AgentStep, CommandRunner, SessionRunner, StepKind};
pub use backend::{Backend, BackendEvent, BackendSpawner, SpawnOptions, SpawnedBackend};
pub use command_state::{CommandState, Effect, Suggestion, SuggestionQuery};
pub use config::{AgentConfig, SessionConfig};
pub use debounce::Debouncer;
pub use error::{AgentError, OracleError, SessionError};
pub use events::{EventSink, EventStream, OutboundEvent};
pub use manager::SessionManager;
pub use oracle::{AgentMessage, CompletionOracle, CompletionRequest, OpenAiOracle, OracleConfig, PlanningOracle};
pub use pty::PtySpawner;
pub use session::{SessionId, SessionStatus};
pub use settings::{Gates, GatesReceiver, GatesUpdate};
