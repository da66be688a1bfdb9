use tokio::sync::mpsc;

use crate::agent::StepKind;
use crate::command_state::Suggestion;
use crate::session::SessionId;

/// Everything the core reports to the UI layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundEvent {
    Output {
        session_id: SessionId,
        data: String,
    },
    Suggestion {
        session_id: SessionId,
        suggestion: Option<Suggestion>,
    },
    /// The backend ended on its own; the session is already gone.
    Exited {
        session_id: SessionId,
        exit_code: Option<i32>,
    },
    AgentStep {
        session_id: SessionId,
        kind: StepKind,
        content: String,
    },
    Notice {
        session_id: SessionId,
        message: String,
    },
}

impl OutboundEvent {
    /// An error shown inline in the session's output stream.
    pub fn inline_error(session_id: SessionId, error: impl std::fmt::Display) -> Self {
        OutboundEvent::Output {
            session_id,
            data: format!("\r\n[Error: {error}]\r\n"),
        }
    }

    pub fn session_id(&self) -> SessionId {
        match self {
            OutboundEvent::Output { session_id, .. }
            | OutboundEvent::Suggestion { session_id, .. }
            | OutboundEvent::Exited { session_id, .. }
            | OutboundEvent::AgentStep { session_id, .. }
            | OutboundEvent::Notice { session_id, .. } => *session_id,
        }
    }
}

pub type EventSink = mpsc::UnboundedSender<OutboundEvent>;
pub type EventStream = mpsc::UnboundedReceiver<OutboundEvent>;
