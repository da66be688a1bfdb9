//! Contracts for the external completion and planning oracles.

pub mod openai;
pub mod prompts;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::agent::AgentStep;
use crate::command_state::Suggestion;
use crate::error::OracleError;

pub use openai::{OpenAiOracle, OracleConfig};

/// Input to the completion oracle: recent commands (oldest first) and the typed buffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompletionRequest {
    pub history: Vec<String>,
    pub partial: String,
}

/// Predicts the command the user is in the middle of typing.
#[async_trait]
pub trait CompletionOracle: Send + Sync {
    /// `Ok(None)` means the oracle has no guess.
    async fn complete(&self, request: &CompletionRequest) -> Result<Option<Suggestion>, OracleError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One entry of an agent run's message log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentMessage {
    pub role: Role,
    pub content: String,
}

impl AgentMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Produces the next plan/action/output step given the whole log so far.
///
/// Implementations are stateless: every call carries the full log.
#[async_trait]
pub trait PlanningOracle: Send + Sync {
    async fn next_step(&self, log: &[AgentMessage]) -> Result<AgentStep, OracleError>;
}
