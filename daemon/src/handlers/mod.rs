pub mod agent;
pub mod auth;
pub mod session;
pub mod settings;

use std::sync::Arc;
use std::time::Instant;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::protocol::*;
use crate::state::{ClientId, DaemonState};

/// Dispatch a request to the appropriate handler
pub async fn dispatch(request: &Request, state: Arc<DaemonState>, client_id: ClientId) -> String {
    let start = Instant::now();
    let method = request.method.as_str();
    let id = request.id;

    debug!(id, method, client_id, "dispatch");

    let response = match method {
        METHOD_AUTH => auth::handle(request, &state).await,
        METHOD_SESSION_CREATE => session::handle_create(request, &state, client_id).await,
        METHOD_SESSION_INPUT => session::handle_input(request, &state).await,
        METHOD_SESSION_RESIZE => session::handle_resize(request, &state).await,
        METHOD_SESSION_CLOSE => session::handle_close(request, &state).await,
        METHOD_AGENT_TASK => agent::handle_task(request, state.clone()).await,
        METHOD_SETTINGS_GET => settings::handle_get(request, &state).await,
        METHOD_SETTINGS_UPDATE => settings::handle_update(request, &state).await,
        _ => {
            warn!(method, "unknown method");
            error(request, INVALID_PARAMS, format!("Unknown method: {}", request.method))
        }
    };

    let elapsed = start.elapsed();
    if response.contains("\"error\"") {
        info!(id, method, ?elapsed, "request failed");
    } else {
        debug!(id, method, ?elapsed, "request ok");
    }

    response
}

/// Decodes `request.params`, or the `invalid_params` response to send instead.
pub(crate) fn params<T: DeserializeOwned>(request: &Request) -> Result<T, String> {
    serde_json::from_value(request.params.clone())
        .map_err(|e| error(request, INVALID_PARAMS, format!("Invalid params: {e}")))
}

pub(crate) fn success<T: Serialize>(request: &Request, result: T) -> String {
    to_line(&SuccessResponse::new(request.id, result))
}

pub(crate) fn error(request: &Request, code: &'static str, message: impl Into<String>) -> String {
    to_line(&ErrorResponse::new(request.id, code, message))
}
