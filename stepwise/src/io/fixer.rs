//! Client side of the planning ("fixer") service.
//!
//! The [`Fixer`] trait decouples self-healing from the transport. The service
//! either answers with a structured `{explanation, plan}` object or with raw
//! model text that still has to be mined for JSON.

use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::core::types::PlanResponse;

/// Maximum history entries the service accepts.
pub const MAX_HISTORY_MESSAGES: usize = 20;
/// Maximum characters per history entry the service accepts.
pub const MAX_HISTORY_CHARS: usize = 5_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: Role,
    pub content: String,
}

/// Request body for `POST /chat`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatRequest {
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_history: Option<Vec<ConversationMessage>>,
}

impl ChatRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            conversation_history: None,
        }
    }

    /// Attach history, keeping the most recent entries within the service limits.
    pub fn with_history(mut self, history: &[ConversationMessage]) -> Self {
        let skip = history.len().saturating_sub(MAX_HISTORY_MESSAGES);
        let trimmed: Vec<ConversationMessage> = history
            .iter()
            .skip(skip)
            .filter(|message| !message.content.trim().is_empty())
            .map(|message| ConversationMessage {
                role: message.role,
                content: message.content.chars().take(MAX_HISTORY_CHARS).collect(),
            })
            .collect();
        self.conversation_history = (!trimmed.is_empty()).then_some(trimmed);
        self
    }
}

/// What the fixer sent back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FixerReply {
    /// Already-parsed plan object.
    Structured(PlanResponse),
    /// Raw model text; JSON must be extracted.
    Text(String),
}

/// Abstraction over the planning service.
pub trait Fixer {
    fn chat(&self, request: &ChatRequest) -> Result<FixerReply>;
}

/// Fixer that talks to the HTTP planning service.
pub struct HttpFixer {
    endpoint: String,
    client: reqwest::blocking::Client,
}

impl HttpFixer {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .context("build fixer http client")?;
        Ok(Self {
            endpoint: format!("{}/chat", base_url.trim_end_matches('/')),
            client,
        })
    }
}

impl Fixer for HttpFixer {
    #[instrument(skip_all, fields(endpoint = %self.endpoint, prompt_bytes = request.prompt.len()))]
    fn chat(&self, request: &ChatRequest) -> Result<FixerReply> {
        debug!("sending fixer request");
        let response = self
            .client
            .post(&self.endpoint)
            .json(request)
            .send()
            .with_context(|| format!("POST {}", self.endpoint))?;
        let status = response.status();
        let body: Value = response
            .json()
            .with_context(|| format!("parse fixer response from {}", self.endpoint))?;
        if !status.is_success() {
            warn!(status = %status, "fixer returned an error status");
        }
        parse_reply(body)
            .with_context(|| format!("fixer response from {} (status {status})", self.endpoint))
    }
}

/// Interpret a fixer response body.
///
/// Accepted shapes: `{plan: [...]}`, `{response: "<text>"}`, or a bare string.
/// `{error, details?}` becomes an error.
pub fn parse_reply(body: Value) -> Result<FixerReply> {
    match body {
        Value::String(text) => Ok(FixerReply::Text(text)),
        Value::Object(ref map) if map.contains_key("plan") => {
            let plan: PlanResponse =
                serde_json::from_value(body.clone()).context("parse structured plan")?;
            Ok(FixerReply::Structured(plan))
        }
        Value::Object(map) => {
            if let Some(Value::String(text)) = map.get("response") {
                return Ok(FixerReply::Text(text.clone()));
            }
            if let Some(error) = map.get("error") {
                let details = map
                    .get("details")
                    .and_then(Value::as_str)
                    .map(|details| format!(": {details}"))
                    .unwrap_or_default();
                return Err(anyhow!("fixer error: {}{details}", value_text(error)));
            }
            Err(anyhow!("fixer response has neither plan nor response"))
        }
        other => Err(anyhow!("unexpected fixer response: {other}")),
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn structured_reply_is_parsed() {
        let reply = parse_reply(json!({
            "explanation": "retry with npm ci",
            "plan": [{"action": "run_command", "command": "npm ci"}]
        }))
        .expect("reply");
        let FixerReply::Structured(plan) = reply else {
            panic!("expected structured reply");
        };
        assert_eq!(plan.plan[0].command.as_deref(), Some("npm ci"));
    }

    #[test]
    fn text_reply_is_passed_through() {
        let reply = parse_reply(json!({"response": "```json\n{}\n```"})).expect("reply");
        assert_eq!(reply, FixerReply::Text("```json\n{}\n```".to_string()));
        let bare = parse_reply(json!("plain")).expect("reply");
        assert_eq!(bare, FixerReply::Text("plain".to_string()));
    }

    #[test]
    fn error_reply_is_an_error() {
        let err = parse_reply(json!({"error": "model request failed", "details": "timeout"}))
            .unwrap_err();
        assert_eq!(err.to_string(), "fixer error: model request failed: timeout");
        assert!(parse_reply(json!({"unexpected": true})).is_err());
        assert!(parse_reply(json!(42)).is_err());
    }

    #[test]
    fn history_is_capped() {
        let history: Vec<ConversationMessage> = (0..30)
            .map(|i| ConversationMessage {
                role: if i % 2 == 0 { Role::User } else { Role::Assistant },
                content: format!("{i}:{}", "x".repeat(6_000)),
            })
            .collect();
        let request = ChatRequest::new("fix it").with_history(&history);
        let kept = request.conversation_history.expect("history");
        assert_eq!(kept.len(), MAX_HISTORY_MESSAGES);
        assert!(kept[0].content.starts_with("10:"));
        assert!(kept.iter().all(|m| m.content.chars().count() <= MAX_HISTORY_CHARS));
    }

    #[test]
    fn request_omits_empty_history() {
        let body = serde_json::to_value(ChatRequest::new("p").with_history(&[])).expect("json");
        assert_eq!(body, json!({"prompt": "p"}));
    }
}
