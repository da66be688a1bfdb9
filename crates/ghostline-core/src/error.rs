use thiserror::Error;

use crate::session::SessionId;

/// Errors raised by session lifecycle and I/O operations.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("failed to start terminal: {0}")]
    Spawn(String),

    #[error("session not found: {0}")]
    NotFound(SessionId),

    #[error("session is not running: {0}")]
    NotRunning(SessionId),

    #[error("terminal I/O error: {0}")]
    Io(String),

    #[error("terminal exited before the command completed")]
    BackendExited,

    #[error("another command is still executing in session {0}")]
    Busy(SessionId),

    #[error("command did not complete within {0:?}")]
    SentinelTimeout(std::time::Duration),
}

impl From<std::io::Error> for SessionError {
    fn from(err: std::io::Error) -> Self {
        SessionError::Io(err.to_string())
    }
}

/// Errors from the completion and planning oracles.
///
/// `Clone` so a single debounced result can be handed to every coalesced caller.
#[derive(Clone, Error, Debug, PartialEq, Eq)]
pub enum OracleError {
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("API error: {0}")]
    Api(String),

    #[error("request timed out")]
    Timeout,

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("unrecognized step: {0}")]
    UnknownStep(String),
}

/// Errors that end an agent loop invocation.
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("planning oracle failed {attempts} times in a row: {last}")]
    Oracle { attempts: u32, last: OracleError },

    #[error("planning oracle returned an unrecognized step: {0}")]
    UnknownStep(String),

    #[error("agent stopped after {0} steps without producing output")]
    StepLimit(u32),

    #[error("agent run was cancelled")]
    Cancelled,
}
