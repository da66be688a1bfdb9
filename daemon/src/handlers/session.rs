use ghostline_core::SessionError;
use tracing::warn;

use super::{error, params, success};
use crate::protocol::*;
use crate::state::{ClientId, DaemonState};

/// Wire error code for a failed session operation.
fn error_code(e: &SessionError) -> &'static str {
    match e {
        SessionError::Spawn(_) => SPAWN_FAILED,
        SessionError::NotFound(_) => SESSION_NOT_FOUND,
        _ => INTERNAL_ERROR,
    }
}

pub async fn handle_create(request: &Request, state: &DaemonState, client_id: ClientId) -> String {
    match state.create_session(client_id).await {
        Ok(session_id) => success(request, SessionCreateResult { session_id }),
        Err(e) => {
            warn!(client_id, error = %e, "session_create failed");
            error(request, error_code(&e), e.to_string())
        }
    }
}

pub async fn handle_input(request: &Request, state: &DaemonState) -> String {
    let params: SessionInputParams = match params(request) {
        Ok(p) => p,
        Err(response) => return response,
    };

    state.manager.write(params.session_id, params.data).await;
    success(request, EmptyResult {})
}

pub async fn handle_resize(request: &Request, state: &DaemonState) -> String {
    let params: SessionResizeParams = match params(request) {
        Ok(p) => p,
        Err(response) => return response,
    };

    state
        .manager
        .resize(params.session_id, params.cols, params.rows)
        .await;
    success(request, EmptyResult {})
}

pub async fn handle_close(request: &Request, state: &DaemonState) -> String {
    let params: SessionIdParams = match params(request) {
        Ok(p) => p,
        Err(response) => return response,
    };

    state.close_session(params.session_id).await;
    success(request, EmptyResult {})
}

#[cfg(test)]
mod tests {
    use super::*;
    use ghostline_core::SessionId;

    #[test]
    fn session_errors_map_to_wire_codes() {
        assert_eq!(error_code(&SessionError::Spawn("no shell".into())), SPAWN_FAILED);
        assert_eq!(error_code(&SessionError::NotFound(SessionId::new())), SESSION_NOT_FOUND);
        assert_eq!(error_code(&SessionError::Io("pty closed".into())), INTERNAL_ERROR);
        assert_eq!(error_code(&SessionError::BackendExited), INTERNAL_ERROR);
    }
}
