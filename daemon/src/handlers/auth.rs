use super::{error, params, success};
use crate::protocol::*;
use crate::state::DaemonState;

pub async fn handle(request: &Request, state: &DaemonState) -> String {
    let params: AuthParams = match params(request) {
        Ok(p) => p,
        Err(response) => return response,
    };

    match &state.token {
        Some(expected) if params.token == *expected => success(request, AuthResult { ok: true }),
        Some(_) => error(request, AUTH_FAILED, "Invalid token"),
        // Auth not required, always succeed
        None => success(request, AuthResult { ok: true }),
    }
}

/// Whether an auth response line reports success.
pub fn is_success(response: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(response)
        .ok()
        .and_then(|value| value.get("result")?.get("ok")?.as_bool())
        .unwrap_or(false)
}
