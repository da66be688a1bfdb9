use ghostline_core::{Gates, OutboundEvent, SessionId, StepKind, Suggestion};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON-RPC request from client
#[derive(Debug, Deserialize)]
pub struct Request {
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// JSON-RPC success response
#[derive(Debug, Serialize)]
pub struct SuccessResponse {
    pub id: u64,
    pub result: Value,
}

/// JSON-RPC error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub id: u64,
    pub error: RpcError,
}

/// Error details
#[derive(Debug, Serialize)]
pub struct RpcError {
    pub code: &'static str,
    pub message: String,
}

/// Server→Client event (no id)
#[derive(Debug, Serialize)]
pub struct Event {
    pub method: &'static str,
    pub params: Value,
}

// Error codes
pub const AUTH_REQUIRED: &str = "auth_required";
pub const AUTH_FAILED: &str = "auth_failed";
pub const INVALID_PARAMS: &str = "invalid_params";
pub const SESSION_NOT_FOUND: &str = "session_not_found";
pub const SPAWN_FAILED: &str = "spawn_failed";
pub const FEATURE_DISABLED: &str = "feature_disabled";
pub const INTERNAL_ERROR: &str = "internal_error";

// Method names
pub const METHOD_AUTH: &str = "auth";
pub const METHOD_SESSION_CREATE: &str = "session_create";
pub const METHOD_SESSION_INPUT: &str = "session_input";
pub const METHOD_SESSION_RESIZE: &str = "session_resize";
pub const METHOD_SESSION_CLOSE: &str = "session_close";
pub const METHOD_AGENT_TASK: &str = "agent_task";
pub const METHOD_SETTINGS_GET: &str = "settings_get";
pub const METHOD_SETTINGS_UPDATE: &str = "settings_update";

// Event names
pub const EVENT_TERMINAL_OUTPUT: &str = "terminal_output";
pub const EVENT_SUGGESTED_COMMAND: &str = "suggested_command";
pub const EVENT_TERMINAL_EXITED: &str = "terminal_exited";
pub const EVENT_AGENT_STEP: &str = "agent_step";
pub const EVENT_NOTICE: &str = "notice";

/// Used if a response somehow fails to serialize.
const FALLBACK_ERROR_LINE: &str =
    r#"{"id":0,"error":{"code":"internal_error","message":"failed to encode response"}}"#;

// --- Request params ---

#[derive(Debug, Deserialize)]
pub struct AuthParams {
    pub token: String,
}

#[derive(Debug, Deserialize)]
pub struct SessionIdParams {
    pub session_id: SessionId,
}

#[derive(Debug, Deserialize)]
pub struct SessionInputParams {
    pub session_id: SessionId,
    pub data: String,
}

#[derive(Debug, Deserialize)]
pub struct SessionResizeParams {
    /// Absent means every session.
    #[serde(default)]
    pub session_id: Option<SessionId>,
    pub cols: u16,
    pub rows: u16,
}

#[derive(Debug, Deserialize)]
pub struct AgentTaskParams {
    pub session_id: SessionId,
    pub text: String,
}

// --- Response types ---

#[derive(Debug, Serialize)]
pub struct AuthResult {
    pub ok: bool,
}

#[derive(Debug, Serialize)]
pub struct SessionCreateResult {
    pub session_id: SessionId,
}

#[derive(Debug, Serialize)]
pub struct AgentTaskResult {
    pub started: bool,
}

#[derive(Debug, Serialize)]
pub struct EmptyResult {}

pub type SettingsResult = Gates;

// --- Event params ---

#[derive(Debug, Serialize)]
pub struct TerminalOutputParams<'a> {
    pub session_id: SessionId,
    pub data: &'a str,
}

#[derive(Debug, Serialize)]
pub struct SuggestedCommandParams<'a> {
    pub session_id: SessionId,
    pub suggestion: Option<&'a Suggestion>,
}

#[derive(Debug, Serialize)]
pub struct TerminalExitedParams {
    pub session_id: SessionId,
    pub exit_code: Option<i32>,
}

#[derive(Debug, Serialize)]
pub struct AgentStepParams<'a> {
    pub session_id: SessionId,
    pub step: StepKind,
    pub content: &'a str,
}

#[derive(Debug, Serialize)]
pub struct NoticeParams<'a> {
    pub session_id: SessionId,
    pub message: &'a str,
}

// --- Helpers ---

impl SuccessResponse {
    pub fn new<T: Serialize>(id: u64, result: T) -> Self {
        Self {
            id,
            result: serde_json::to_value(result).unwrap_or(Value::Null),
        }
    }
}

impl ErrorResponse {
    pub fn new(id: u64, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            id,
            error: RpcError {
                code,
                message: message.into(),
            },
        }
    }
}

impl Event {
    pub fn new<T: Serialize>(method: &'static str, params: T) -> Self {
        Self {
            method,
            params: serde_json::to_value(params).unwrap_or(Value::Null),
        }
    }

    /// Wire form of a core event.
    pub fn from_outbound(event: &OutboundEvent) -> Self {
        match event {
            OutboundEvent::Output { session_id, data } => Event::new(
                EVENT_TERMINAL_OUTPUT,
                TerminalOutputParams {
                    session_id: *session_id,
                    data,
                },
            ),
            OutboundEvent::Suggestion {
                session_id,
                suggestion,
            } => Event::new(
                EVENT_SUGGESTED_COMMAND,
                SuggestedCommandParams {
                    session_id: *session_id,
                    suggestion: suggestion.as_ref(),
                },
            ),
            OutboundEvent::Exited {
                session_id,
                exit_code,
            } => Event::new(
                EVENT_TERMINAL_EXITED,
                TerminalExitedParams {
                    session_id: *session_id,
                    exit_code: *exit_code,
                },
            ),
            OutboundEvent::AgentStep {
                session_id,
                kind,
                content,
            } => Event::new(
                EVENT_AGENT_STEP,
                AgentStepParams {
                    session_id: *session_id,
                    step: *kind,
                    content,
                },
            ),
            OutboundEvent::Notice {
                session_id,
                message,
            } => Event::new(
                EVENT_NOTICE,
                NoticeParams {
                    session_id: *session_id,
                    message,
                },
            ),
        }
    }
}

/// Serializes one protocol message as a single line (without the newline).
pub fn to_line<T: Serialize>(message: &T) -> String {
    serde_json::to_string(message).unwrap_or_else(|_| FALLBACK_ERROR_LINE.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_defaults_params_to_null() {
        let request: Request = serde_json::from_str(r#"{"id":1,"method":"auth"}"#)
            .expect("request to parse");
        assert_eq!(request.id, 1);
        assert_eq!(request.method, "auth");
        assert_eq!(request.params, json!(null));
    }

    #[test]
    fn success_response_serializes_result() {
        let response = SuccessResponse::new(2, SessionCreateResult {
            session_id: "2f1c6a55-6a53-4b7e-9c7c-1d2b0c8f4e11".parse().unwrap(),
        });
        let value = serde_json::to_value(response).expect("response to serialize");
        assert_eq!(value.get("id"), Some(&json!(2)));
        assert_eq!(
            value.get("result"),
            Some(&json!({"session_id": "2f1c6a55-6a53-4b7e-9c7c-1d2b0c8f4e11"}))
        );
    }

    #[test]
    fn error_response_serializes_error() {
        let response = ErrorResponse::new(3, AUTH_FAILED, "nope");
        let value = serde_json::to_value(response).expect("error to serialize");
        assert_eq!(value.get("id"), Some(&json!(3)));
        let error = value.get("error").expect("error field");
        assert_eq!(error.get("code"), Some(&json!(AUTH_FAILED)));
        assert_eq!(error.get("message"), Some(&json!("nope")));
    }

    #[test]
    fn resize_session_id_is_optional() {
        let params: SessionResizeParams =
            serde_json::from_value(json!({"cols": 120, "rows": 40})).expect("params to parse");
        assert_eq!(params.session_id, None);
        assert_eq!((params.cols, params.rows), (120, 40));
    }

    #[test]
    fn malformed_session_id_is_rejected() {
        let parsed = serde_json::from_value::<SessionIdParams>(json!({"session_id": "not-a-uuid"}));
        assert!(parsed.is_err());
    }

    #[test]
    fn suggestion_event_carries_null_when_cleared() {
        let session_id = SessionId::new();
        let event = Event::from_outbound(&OutboundEvent::Suggestion {
            session_id,
            suggestion: None,
        });
        let value = serde_json::to_value(event).expect("event to serialize");
        assert_eq!(value.get("method"), Some(&json!(EVENT_SUGGESTED_COMMAND)));
        assert_eq!(
            value.get("params"),
            Some(&json!({"session_id": session_id.to_string(), "suggestion": null}))
        );
    }

    #[test]
    fn suggestion_event_carries_both_fields() {
        let session_id = SessionId::new();
        let event = Event::from_outbound(&OutboundEvent::Suggestion {
            session_id,
            suggestion: Some(Suggestion {
                full_command: "git status".into(),
                next_portion: "status".into(),
            }),
        });
        let params = serde_json::to_value(event).expect("event to serialize")["params"].clone();
        assert_eq!(
            params["suggestion"],
            json!({"full_command": "git status", "next_portion": "status"})
        );
    }

    #[test]
    fn agent_step_event_uses_lowercase_step() {
        let session_id = SessionId::new();
        let event = Event::from_outbound(&OutboundEvent::AgentStep {
            session_id,
            kind: StepKind::Observe,
            content: "ok".into(),
        });
        let value = serde_json::to_value(event).expect("event to serialize");
        assert_eq!(value["method"], json!(EVENT_AGENT_STEP));
        assert_eq!(value["params"]["step"], json!("observe"));
        assert_eq!(value["params"]["content"], json!("ok"));
    }

    #[test]
    fn exited_event_keeps_missing_exit_code() {
        let session_id = SessionId::new();
        let event = Event::from_outbound(&OutboundEvent::Exited {
            session_id,
            exit_code: None,
        });
        let value = serde_json::to_value(event).expect("event to serialize");
        assert_eq!(value["method"], json!(EVENT_TERMINAL_EXITED));
        assert_eq!(value["params"]["exit_code"], json!(null));
    }

    #[test]
    fn to_line_is_single_line() {
        let line = to_line(&Event::new(EVENT_TERMINAL_OUTPUT, json!({"data": "a\nb"})));
        assert!(!line.contains('\n'));
    }
}
