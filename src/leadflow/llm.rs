//! Opaque LLM backend adapter.
//!
//! The dispatcher hands the backend a constant system prompt, a bounded
//! window of recent thread messages, and structured context (stage,
//! funnel, contact name). The backend answers with free text that may
//! contain an embedded JSON action descriptor; [`parse_reply`] turns
//! that into a tagged [`LlmReply`] with strict validation: an embedded
//! object with a `response_type` tag takes precedence over any prose
//! around it, and a partial or ambiguous descriptor is rejected as
//! malformed rather than guessed at.
//!
//! Failures of any kind (timeout, transport, malformed output) are
//! never treated as triggers; the dispatcher answers with the
//! configured generic fallback text and leaves the stage untouched.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::leadflow::error::LlmError;
use crate::leadflow::sender::get_shared_http_client;
use crate::leadflow::store::Role;

/// One turn of conversation history handed to the backend.
#[derive(Debug, Clone)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
}

/// Structured context accompanying every completion request.
#[derive(Debug, Clone, Default)]
pub struct LlmContext {
    pub funnel_id: Option<String>,
    pub stage: Option<String>,
    pub contact_name: Option<String>,
}

impl LlmContext {
    /// Render the context block appended to the system prompt.
    fn render(&self) -> String {
        format!(
            "\n\nConversation context: funnel={}, stage={}, contact_name={}.",
            self.funnel_id.as_deref().unwrap_or("unknown"),
            self.stage.as_deref().unwrap_or("unknown"),
            self.contact_name.as_deref().unwrap_or("unknown"),
        )
    }
}

/// Discriminant of a structured action descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmResponseType {
    Audio,
    Template,
    Text,
}

/// A validated structured action descriptor emitted by the backend.
#[derive(Debug, Clone)]
pub struct LlmAction {
    pub response_type: LlmResponseType,
    pub asset_id: Option<String>,
    pub template_code: Option<String>,
    pub message: Option<String>,
    /// Requested stage transition; only committed when it is a legal
    /// successor of the thread's current stage.
    pub next_stage: Option<String>,
}

/// What the backend asked us to do.
#[derive(Debug, Clone)]
pub enum LlmReply {
    /// A free-form text reply.
    Text(String),
    /// A structured action descriptor.
    Action(LlmAction),
}

/// Trait-driven abstraction over the generative backend.
///
/// Implementations return the raw completion string; interpretation is
/// centralized in [`parse_reply`] so every backend gets the same
/// defensive treatment.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    async fn complete(
        &self,
        system_prompt: &str,
        history: &[ChatTurn],
        context: &LlmContext,
    ) -> Result<String, LlmError>;
}

/// Scan `raw` for the first parseable top-level JSON object.
fn extract_json_object(raw: &str) -> Option<Value> {
    let bytes = raw.as_bytes();
    let mut start = 0;
    while let Some(rel) = raw[start..].find('{') {
        let open = start + rel;
        let mut depth = 0usize;
        let mut in_string = false;
        let mut escaped = false;
        for (offset, &b) in bytes[open..].iter().enumerate() {
            match b {
                b'"' if !escaped => in_string = !in_string,
                b'{' if !in_string => depth += 1,
                b'}' if !in_string => {
                    depth -= 1;
                    if depth == 0 {
                        let candidate = &raw[open..open + offset + 1];
                        if let Ok(value) = serde_json::from_str::<Value>(candidate) {
                            return Some(value);
                        }
                        break;
                    }
                }
                _ => {}
            }
            escaped = b == b'\\' && !escaped;
        }
        start = open + 1;
    }
    None
}

fn opt_string(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Interpret a raw completion.
///
/// A JSON object carrying a `response_type` tag takes precedence over
/// surrounding prose. A tagged object missing its required companion
/// field (`asset_id` for audio, `template_code` for template, `message`
/// for text) or carrying an unknown tag is [`LlmError::Malformed`]. A
/// reply without any tagged object is plain text.
pub fn parse_reply(raw: &str) -> Result<LlmReply, LlmError> {
    let object = match extract_json_object(raw) {
        Some(object) if object.get("response_type").is_some() => object,
        _ => {
            let text = raw.trim();
            if text.is_empty() {
                return Err(LlmError::Malformed("empty completion".to_string()));
            }
            return Ok(LlmReply::Text(text.to_string()));
        }
    };

    let tag = object
        .get("response_type")
        .and_then(Value::as_str)
        .ok_or_else(|| LlmError::Malformed("response_type is not a string".to_string()))?;
    let response_type = match tag {
        "audio" => LlmResponseType::Audio,
        "template" => LlmResponseType::Template,
        "text" => LlmResponseType::Text,
        other => {
            return Err(LlmError::Malformed(format!(
                "unknown response_type {:?}",
                other
            )))
        }
    };

    let action = LlmAction {
        response_type,
        asset_id: opt_string(&object, "asset_id"),
        template_code: opt_string(&object, "template_code"),
        message: opt_string(&object, "message"),
        next_stage: opt_string(&object, "next_stage"),
    };
    let complete = match response_type {
        LlmResponseType::Audio => action.asset_id.is_some(),
        LlmResponseType::Template => action.template_code.is_some(),
        LlmResponseType::Text => action.message.is_some(),
    };
    if !complete {
        return Err(LlmError::Malformed(format!(
            "response_type {:?} missing its required field",
            tag
        )));
    }
    Ok(LlmReply::Action(action))
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token-bucket limiter for LLM requests; capacity and refill rate are
/// operator-configurable.
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(capacity: f64, refill_per_sec: f64) -> Self {
        Self {
            capacity: capacity.max(1.0),
            refill_per_sec: refill_per_sec.max(0.01),
            state: Mutex::new(BucketState {
                tokens: capacity.max(1.0),
                last_refill: Instant::now(),
            }),
        }
    }

    /// Wait until a token is available, then take it.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(state.last_refill).as_secs_f64();
                state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
                state.last_refill = now;
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return;
                }
                Duration::from_secs_f64((1.0 - state.tokens) / self.refill_per_sec)
            };
            tokio::time::sleep(wait).await;
        }
    }
}

#[derive(Serialize)]
struct WireMessage {
    role: &'static str,
    content: String,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

/// Client for any backend exposing the OpenAI-compatible
/// chat-completions surface.
pub struct OpenAiCompatClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    bucket: TokenBucket,
}

impl OpenAiCompatClient {
    pub fn new(base_url: &str, api_key: &str, model: &str, bucket: TokenBucket) -> Self {
        Self {
            http: get_shared_http_client().clone(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            bucket,
        }
    }
}

#[async_trait]
impl LlmBackend for OpenAiCompatClient {
    async fn complete(
        &self,
        system_prompt: &str,
        history: &[ChatTurn],
        context: &LlmContext,
    ) -> Result<String, LlmError> {
        self.bucket.acquire().await;

        let mut messages = Vec::with_capacity(history.len() + 1);
        messages.push(WireMessage {
            role: "system",
            content: format!("{}{}", system_prompt, context.render()),
        });
        for turn in history {
            messages.push(WireMessage {
                role: match turn.role {
                    Role::User => "user",
                    Role::Assistant => "assistant",
                    Role::System => "system",
                },
                content: turn.content.clone(),
            });
        }

        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&ChatRequest {
                model: &self.model,
                messages,
            })
            .send()
            .await
            .map_err(|e| LlmError::Unavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if log::log_enabled!(log::Level::Error) {
                log::error!(
                    "OpenAiCompatClient::complete(...): backend returned {}: {}",
                    status,
                    body
                );
            }
            return Err(LlmError::Unavailable(format!("backend returned {}", status)));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| LlmError::Malformed(e.to_string()))?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| LlmError::Malformed("completion had no content".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_object_beats_prose() {
        let raw = r#"Sure! {"response_type": "audio", "asset_id": "plans"} hope that helps"#;
        match parse_reply(raw) {
            Ok(LlmReply::Action(action)) => {
                assert_eq!(action.response_type, LlmResponseType::Audio);
                assert_eq!(action.asset_id.as_deref(), Some("plans"));
            }
            other => panic!("expected action, got {:?}", other),
        }
    }

    #[test]
    fn partial_descriptor_is_malformed() {
        let raw = r#"{"response_type": "audio"}"#;
        assert!(matches!(parse_reply(raw), Err(LlmError::Malformed(_))));
    }

    #[test]
    fn prose_without_tag_is_text() {
        let raw = "The monthly plan is $29. {\"note\": \"not an action\"}";
        match parse_reply(raw) {
            Ok(LlmReply::Text(text)) => assert!(text.contains("$29")),
            other => panic!("expected text, got {:?}", other),
        }
    }
}
