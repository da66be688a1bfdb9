use std::sync::Arc;

use ghostline_core::run_agent_task;
use tracing::{info, warn};

use super::{error, params, success};
use crate::protocol::*;
use crate::state::DaemonState;

/// Starts an agent run in the background; progress arrives as `agent_step` events.
pub async fn handle_task(request: &Request, state: Arc<DaemonState>) -> String {
    let params: AgentTaskParams = match params(request) {
        Ok(p) => p,
        Err(response) => return response,
    };

    let Some(agent) = state.agent.clone() else {
        return error(
            request,
            FEATURE_DISABLED,
            "Agent needs an oracle API key (set GHOSTLINE_API_KEY)",
        );
    };

    if !state.manager.contains(params.session_id).await {
        return error(
            request,
            SESSION_NOT_FOUND,
            format!("Session not found: {}", params.session_id),
        );
    }

    // With the gate off the run only emits a notice.
    let started = state.gates().agent_enabled;
    let manager = state.manager.clone();
    tokio::spawn(async move {
        match run_agent_task(&manager, &agent, params.session_id, &params.text).await {
            Ok(Some(_)) => info!(session_id = %params.session_id, "agent task finished"),
            Ok(None) => {}
            Err(e) => warn!(session_id = %params.session_id, error = %e, "agent task failed"),
        }
    });

    success(request, AgentTaskResult { started })
}
