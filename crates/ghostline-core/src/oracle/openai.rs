//! Oracle client for OpenAI-compatible chat-completions endpoints (Groq by default).

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, trace, warn};

use super::prompts::{COMPLETION_SYSTEM_PROMPT, PLANNING_SYSTEM_PROMPT};
use super::{AgentMessage, CompletionOracle, CompletionRequest, PlanningOracle};
use crate::agent::AgentStep;
use crate::command_state::Suggestion;
use crate::error::OracleError;

#[derive(Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct OracleConfig {
    pub base_url: String,
    pub api_key: String,
    pub completion_model: String,
    pub planning_model: String,
    pub request_timeout_secs: u64,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.groq.com/openai/v1".to_string(),
            api_key: String::new(),
            completion_model: "llama-3.1-8b-instant".to_string(),
            planning_model: "llama-3.3-70b-versatile".to_string(),
            request_timeout_secs: 30,
        }
    }
}

impl fmt::Debug for OracleConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OracleConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &"[REDACTED]")
            .field("completion_model", &self.completion_model)
            .field("planning_model", &self.planning_model)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .finish()
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    response_format: ResponseFormat,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

#[derive(Debug, Deserialize)]
struct CompletionAnswer {
    #[serde(default)]
    full_command: String,
    #[serde(default)]
    next_portion: String,
}

#[derive(Debug, Serialize)]
struct CompletionPayload<'a> {
    history: &'a [String],
    current_command: &'a str,
}

/// Implements both oracle contracts on top of one HTTP client.
pub struct OpenAiOracle {
    config: OracleConfig,
    http_client: Client,
}

impl OpenAiOracle {
    pub fn new(config: OracleConfig) -> Result<Self, OracleError> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs.max(1)))
            .build()
            .map_err(|e| OracleError::Http(e.to_string()))?;

        if config.api_key.is_empty() {
            warn!("oracle API key is empty; oracle requests will fail");
        }

        Ok(Self {
            config,
            http_client,
        })
    }

    async fn chat(&self, model: &str, messages: Vec<ChatMessage<'_>>) -> Result<String, OracleError> {
        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));
        let body = ChatRequest {
            model,
            messages,
            response_format: ResponseFormat {
                format_type: "json_object",
            },
        };
        trace!(url = %url, model = %model, message_count = body.messages.len(), "sending chat request");

        let response = self
            .http_client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    OracleError::Timeout
                } else {
                    OracleError::Http(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            debug!(status = %status, "oracle returned an error status");
            return Err(match response.json::<ApiErrorBody>().await {
                Ok(body) => OracleError::Api(body.error.message),
                Err(_) => OracleError::Api(format!("HTTP {status}")),
            });
        }

        let chat: ChatResponse = response
            .json()
            .await
            .map_err(|e| OracleError::InvalidResponse(e.to_string()))?;

        chat.choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| OracleError::InvalidResponse("response has no content".to_string()))
    }
}

/// Parses the completion oracle's JSON reply. Empty `full_command` means no guess.
pub fn parse_completion_content(content: &str) -> Result<Option<Suggestion>, OracleError> {
    let answer: CompletionAnswer = serde_json::from_str(content.trim())
        .map_err(|e| OracleError::InvalidResponse(e.to_string()))?;
    if answer.full_command.is_empty() {
        return Ok(None);
    }
    Ok(Some(Suggestion {
        full_command: answer.full_command,
        next_portion: answer.next_portion,
    }))
}

#[async_trait]
impl CompletionOracle for OpenAiOracle {
    #[instrument(skip(self, request), fields(partial_len = request.partial.len()))]
    async fn complete(&self, request: &CompletionRequest) -> Result<Option<Suggestion>, OracleError> {
        let payload = serde_json::to_string(&CompletionPayload {
            history: &request.history,
            current_command: &request.partial,
        })
        .map_err(|e| OracleError::InvalidResponse(e.to_string()))?;

        let messages = vec![
            ChatMessage {
                role: "system",
                content: COMPLETION_SYSTEM_PROMPT,
            },
            ChatMessage {
                role: "user",
                content: &payload,
            },
        ];
        let content = self.chat(&self.config.completion_model, messages).await?;
        parse_completion_content(&content)
    }
}

#[async_trait]
impl PlanningOracle for OpenAiOracle {
    #[instrument(skip(self, log), fields(log_len = log.len()))]
    async fn next_step(&self, log: &[AgentMessage]) -> Result<AgentStep, OracleError> {
        let mut messages = Vec::with_capacity(log.len() + 1);
        if log.first().map(|m| m.role) != Some(super::Role::System) {
            messages.push(ChatMessage {
                role: "system",
                content: PLANNING_SYSTEM_PROMPT,
            });
        }
        messages.extend(log.iter().map(|message| ChatMessage {
            role: match message.role {
                super::Role::System => "system",
                super::Role::User => "user",
                super::Role::Assistant => "assistant",
            },
            content: &message.content,
        }));

        let content = self.chat(&self.config.planning_model, messages).await?;
        AgentStep::parse(&content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_completion_answer() {
        let suggestion = parse_completion_content(r#"{"full_command":"git clone","next_portion":"t clone"}"#)
            .expect("valid answer");
        assert_eq!(
            suggestion,
            Some(Suggestion {
                full_command: "git clone".into(),
                next_portion: "t clone".into(),
            })
        );
    }

    #[test]
    fn empty_completion_answer_means_no_guess() {
        let suggestion = parse_completion_content(r#"{"full_command":"","next_portion":""}"#)
            .expect("valid answer");
        assert_eq!(suggestion, None);
    }

    #[test]
    fn malformed_completion_answer_is_invalid() {
        let err = parse_completion_content("not json").unwrap_err();
        assert!(matches!(err, OracleError::InvalidResponse(_)));
    }

    #[test]
    fn debug_output_redacts_api_key() {
        let config = OracleConfig {
            api_key: "gsk_secret".into(),
            ..OracleConfig::default()
        };
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("gsk_secret"));
        assert!(rendered.contains("[REDACTED]"));
    }

    #[test]
    fn chat_request_asks_for_json_object() {
        let body = ChatRequest {
            model: "m",
            messages: vec![ChatMessage {
                role: "user",
                content: "hi",
            }],
            response_format: ResponseFormat {
                format_type: "json_object",
            },
        };
        let value = serde_json::to_value(body).expect("request to serialize");
        assert_eq!(value["response_format"]["type"], "json_object");
        assert_eq!(value["messages"][0]["role"], "user");
    }
}
