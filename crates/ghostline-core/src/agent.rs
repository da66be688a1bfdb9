//! Agent loop: lets the planning oracle drive a session one step at a time.
//!
//! Each iteration asks the oracle for exactly one step given the full log so
//! far. `plan` steps are reported and the loop continues, `action` steps run a
//! tool and append its result as an observation, and `output` ends the run.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::AgentConfig;
use crate::error::{AgentError, OracleError, SessionError};
use crate::events::OutboundEvent;
use crate::manager::SessionManager;
use crate::oracle::prompts::PLANNING_SYSTEM_PROMPT;
use crate::oracle::{AgentMessage, PlanningOracle};
use crate::session::SessionId;

/// The one tool the agent can call.
pub const RUN_COMMAND_TOOL: &str = "run_command";

/// One step as produced by the planning oracle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "lowercase")]
pub enum AgentStep {
    Plan {
        #[serde(default)]
        content: String,
    },
    Action {
        #[serde(default)]
        content: String,
        function: String,
        input: String,
    },
    Output {
        #[serde(default)]
        content: String,
    },
}

impl AgentStep {
    pub fn plan(content: impl Into<String>) -> Self {
        AgentStep::Plan {
            content: content.into(),
        }
    }

    pub fn run_command(input: impl Into<String>) -> Self {
        AgentStep::Action {
            content: String::new(),
            function: RUN_COMMAND_TOOL.to_string(),
            input: input.into(),
        }
    }

    pub fn output(content: impl Into<String>) -> Self {
        AgentStep::Output {
            content: content.into(),
        }
    }

    /// Parses an oracle reply. Tags other than plan/action/output are reported
    /// as [`OracleError::UnknownStep`] rather than as malformed JSON.
    pub fn parse(raw: &str) -> Result<Self, OracleError> {
        let value: Value = serde_json::from_str(raw.trim())
            .map_err(|e| OracleError::InvalidResponse(e.to_string()))?;
        let tag = value
            .get("step")
            .and_then(Value::as_str)
            .ok_or_else(|| OracleError::InvalidResponse("missing \"step\" field".to_string()))?;

        match tag {
            "plan" | "action" | "output" => {
                serde_json::from_value(value).map_err(|e| OracleError::InvalidResponse(e.to_string()))
            }
            other => Err(OracleError::UnknownStep(other.to_string())),
        }
    }

    pub fn kind(&self) -> StepKind {
        match self {
            AgentStep::Plan { .. } => StepKind::Plan,
            AgentStep::Action { .. } => StepKind::Action,
            AgentStep::Output { .. } => StepKind::Output,
        }
    }

    fn to_log_entry(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// What an `agent_step` event reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    Plan,
    Action,
    Observe,
    Output,
}

/// Runs shell commands on the agent's behalf.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run_command(&self, command: &str) -> Result<String, SessionError>;
}

/// Runs commands through [`SessionManager::execute`] on one session.
pub struct SessionRunner {
    manager: SessionManager,
    session_id: SessionId,
    timeout: Option<Duration>,
}

impl SessionRunner {
    pub fn new(manager: SessionManager, session_id: SessionId) -> Self {
        Self {
            manager,
            session_id,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[async_trait]
impl CommandRunner for SessionRunner {
    async fn run_command(&self, command: &str) -> Result<String, SessionError> {
        self.manager
            .execute(self.session_id, command, self.timeout)
            .await
    }
}

fn observation(output: &str) -> String {
    json!({ "step": "observe", "output": output }).to_string()
}

pub struct AgentLoop {
    planner: Arc<dyn PlanningOracle>,
    config: AgentConfig,
}

impl AgentLoop {
    pub fn new(planner: Arc<dyn PlanningOracle>, config: AgentConfig) -> Self {
        Self { planner, config }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Drives `task` to completion and returns the final output.
    ///
    /// `progress` is told about every step as it happens, including the
    /// observation produced by each action.
    #[instrument(skip(self, runner, progress, cancel), fields(task_len = task.len()))]
    pub async fn run<F>(
        &self,
        task: &str,
        runner: &dyn CommandRunner,
        mut progress: F,
        cancel: &CancellationToken,
    ) -> Result<String, AgentError>
    where
        F: FnMut(StepKind, &str) + Send,
    {
        let mut log = vec![
            AgentMessage::system(PLANNING_SYSTEM_PROMPT),
            AgentMessage::user(task),
        ];
        let mut consecutive_failures = 0u32;

        for iteration in 1..=self.config.max_steps {
            let reply = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(AgentError::Cancelled),
                reply = self.planner.next_step(&log) => reply,
            };

            let step = match reply {
                Ok(step) => {
                    consecutive_failures = 0;
                    step
                }
                Err(OracleError::UnknownStep(tag)) => {
                    warn!(tag = %tag, "planning oracle returned an unknown step");
                    return Err(AgentError::UnknownStep(tag));
                }
                Err(e) => {
                    consecutive_failures += 1;
                    warn!(
                        iteration,
                        attempts = consecutive_failures,
                        error = %e,
                        "planning oracle request failed"
                    );
                    if consecutive_failures >= self.config.max_oracle_failures {
                        return Err(AgentError::Oracle {
                            attempts: consecutive_failures,
                            last: e,
                        });
                    }
                    continue;
                }
            };

            debug!(iteration, kind = ?step.kind(), "agent step");
            log.push(AgentMessage::assistant(step.to_log_entry()));

            match step {
                AgentStep::Plan { content } => progress(StepKind::Plan, &content),
                AgentStep::Action {
                    function, input, ..
                } => {
                    progress(StepKind::Action, &input);
                    let result = if function == RUN_COMMAND_TOOL {
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => return Err(AgentError::Cancelled),
                            result = runner.run_command(&input) => match result {
                                Ok(output) => output,
                                Err(e) => {
                                    warn!(command = %input, error = %e, "agent command failed");
                                    format!("[ERROR] {e}")
                                }
                            },
                        }
                    } else {
                        warn!(function = %function, "agent asked for an unknown tool");
                        format!("[ERROR] unknown tool: {function}")
                    };
                    progress(StepKind::Observe, &result);
                    log.push(AgentMessage::user(observation(&result)));
                }
                AgentStep::Output { content } => {
                    progress(StepKind::Output, &content);
                    info!(iteration, "agent finished");
                    return Ok(content);
                }
            }
        }

        warn!(max_steps = self.config.max_steps, "agent hit its step limit");
        Err(AgentError::StepLimit(self.config.max_steps))
    }
}

/// Runs `task` on a session, streaming each step as an `AgentStep` event.
///
/// When the agent gate is off, or the session is gone, a notice is emitted
/// instead and `Ok(None)` is returned.
pub async fn run_agent_task(
    manager: &SessionManager,
    agent: &AgentLoop,
    session_id: SessionId,
    task: &str,
) -> Result<Option<String>, AgentError> {
    let events = manager.events().clone();
    let notice = |message: &str| {
        let _ = events.send(OutboundEvent::Notice {
            session_id,
            message: message.to_string(),
        });
    };

    if !manager.gates().agent_enabled {
        notice("Agent is disabled in settings.");
        return Ok(None);
    }
    let Some(cancel) = manager.cancellation(session_id).await else {
        notice("Session is no longer running.");
        return Ok(None);
    };

    let runner = SessionRunner::new(manager.clone(), session_id);
    let progress = |kind: StepKind, content: &str| {
        let _ = events.send(OutboundEvent::AgentStep {
            session_id,
            kind,
            content: content.to_string(),
        });
    };

    match agent.run(task, &runner, progress, &cancel).await {
        Ok(output) => Ok(Some(output)),
        Err(e) => {
            notice(&format!("Agent stopped: {e}"));
            Err(e)
        }
    }
}
