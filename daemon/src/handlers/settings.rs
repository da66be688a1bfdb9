use ghostline_core::GatesUpdate;

use super::{params, success};
use crate::protocol::*;
use crate::state::DaemonState;

pub async fn handle_get(request: &Request, state: &DaemonState) -> String {
    let result: SettingsResult = state.gates();
    success(request, result)
}

pub async fn handle_update(request: &Request, state: &DaemonState) -> String {
    let update: GatesUpdate = match params(request) {
        Ok(p) => p,
        Err(response) => return response,
    };

    let result: SettingsResult = state.update_gates(update).await;
    success(request, result)
}
