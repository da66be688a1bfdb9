//! Feature gates observed by the core.
//!
//! The core only reads gates through a `watch` receiver; whoever owns the
//! sender (the daemon's settings handler) decides when they change.

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Gates {
    pub suggestions_enabled: bool,
    pub agent_enabled: bool,
}

/// A partial update; absent fields keep their current value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct GatesUpdate {
    #[serde(default)]
    pub suggestions_enabled: Option<bool>,
    #[serde(default)]
    pub agent_enabled: Option<bool>,
}

impl Gates {
    pub fn apply(self, update: GatesUpdate) -> Self {
        Self {
            suggestions_enabled: update
                .suggestions_enabled
                .unwrap_or(self.suggestions_enabled),
            agent_enabled: update.agent_enabled.unwrap_or(self.agent_enabled),
        }
    }
}

pub type GatesReceiver = watch::Receiver<Gates>;
