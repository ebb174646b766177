//! Chat provider seam: message/response types shared by the
//! classifier, consolidator, and record/replay wrapper, plus an
//! OpenAI-compatible HTTP implementation and a tolerant JSON extractor
//! for parsing structured output out of free-form model text.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: ChatRole::System, content: content.into() }
    }
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: ChatRole::User, content: content.into() }
    }
    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: ChatRole::Assistant, content: content.into() }
    }
}

/// A tool the model may call, described in the OpenAI function-calling
/// shape. The classifier and consolidator don't exercise tool calling
/// themselves, but the cache-key hash (the record/replay crate) needs
/// tool names even when the list is empty, so the type lives here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolSpec>,
    #[serde(default)]
    pub temperature: f32,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatResponse {
    pub content: String,
    pub finish_reason: String,
    /// Token accounting reported by the provider (`prompt_tokens`,
    /// `completion_tokens`, `total_tokens`, etc.) — shape varies by
    /// provider, so this is kept as a free-form map rather than a struct.
    #[serde(default, skip_serializing_if = "std::collections::HashMap::is_empty")]
    pub usage: std::collections::HashMap<String, u64>,
    /// Separate reasoning/thinking trace, for providers that report it
    /// apart from `content`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("chat request failed: {0}")]
    Transport(String),
    #[error("chat request timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("model response was not understood: {0}")]
    MalformedResponse(String),
}

/// The seam every chat-capable consumer programs against. Implemented by
/// `HttpChatProvider` for live traffic, and wrapped by the record/replay
/// provider for deterministic test/lab runs.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, ChatError>;
}

/// OpenAI-compatible `/chat/completions` client, usable against Ollama,
/// OpenRouter, or any other endpoint implementing that contract.
pub struct HttpChatProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpChatProvider {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key,
        }
    }
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct WireResponse {
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: std::collections::HashMap<String, u64>,
}

#[derive(Deserialize)]
struct WireChoice {
    message: WireChoiceMessage,
    #[serde(default)]
    finish_reason: String,
}

#[derive(Deserialize)]
struct WireChoiceMessage {
    #[serde(default)]
    content: String,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
}

#[derive(Deserialize)]
struct WireToolCall {
    id: String,
    function: WireToolCallFunction,
}

#[derive(Deserialize)]
struct WireToolCallFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

fn role_str(role: ChatRole) -> &'static str {
    match role {
        ChatRole::System => "system",
        ChatRole::User => "user",
        ChatRole::Assistant => "assistant",
        ChatRole::Tool => "tool",
    }
}

#[async_trait]
impl ChatProvider for HttpChatProvider {
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, ChatError> {
        let wire = WireRequest {
            model: &request.model,
            messages: request
                .messages
                .iter()
                .map(|m| WireMessage { role: role_str(m.role), content: &m.content })
                .collect(),
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        };

        let mut req = self
            .client
            .post(format!("{}/chat/completions", self.base_url.trim_end_matches('/')))
            .json(&wire);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let resp = req.send().await.map_err(|e| ChatError::Transport(e.to_string()))?;
        let resp = resp.error_for_status().map_err(|e| ChatError::Transport(e.to_string()))?;
        let mut parsed: WireResponse = resp.json().await.map_err(|e| ChatError::MalformedResponse(e.to_string()))?;
        let usage = std::mem::take(&mut parsed.usage);

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ChatError::MalformedResponse("response had no choices".to_string()))?;

        let tool_calls = choice
            .message
            .tool_calls
            .into_iter()
            .map(|tc| ToolCall {
                id: tc.id,
                name: tc.function.name,
                arguments: serde_json::from_str(&tc.function.arguments).unwrap_or(serde_json::Value::Null),
            })
            .collect();

        Ok(ChatResponse {
            content: choice.message.content,
            finish_reason: choice.finish_reason,
            usage,
            reasoning_content: choice.message.reasoning_content,
            tool_calls,
        })
    }
}

/// Extracts a `T` from free-form model text via a three-strategy
/// cascade: a raw parse of the whole trimmed string, a fenced
/// ` ```json ` code block, then the first brace-balanced `{...}`
/// substring. Returns `None` when every strategy fails, leaving the
/// caller to fall back to a lower-fidelity parse (§4.6).
pub fn extract_json_output<T: serde::de::DeserializeOwned>(response: &str) -> Option<T> {
    let trimmed = response.trim();

    if let Ok(val) = serde_json::from_str(trimmed) {
        return Some(val);
    }

    if let Some(candidate) = fenced_block(trimmed) {
        if let Ok(val) = serde_json::from_str(&candidate) {
            return Some(val);
        }
    }

    if let Some(candidate) = balanced_brace_substring(trimmed) {
        if let Ok(val) = serde_json::from_str(&candidate) {
            return Some(val);
        }
    }

    None
}

/// Matches a ` ``` ` fence with an optional `json` language tag — the
/// tag is stripped if present, but a bare ` ``` ` fence is just as valid.
fn fenced_block(text: &str) -> Option<String> {
    let fence_start = text.find("```")?;
    let mut after_fence = &text[fence_start + "```".len()..];
    after_fence = after_fence.strip_prefix("json").unwrap_or(after_fence);
    let after_fence = after_fence.trim_start();
    let fence_end = after_fence.find("```")?;
    Some(after_fence[..fence_end].trim().to_string())
}

/// Finds the first `{` and walks forward tracking brace depth (ignoring
/// braces inside string literals) to find its matching `}`. More robust
/// than a naive first-`{`/last-`}` pairing when the response has trailing
/// prose containing its own braces.
fn balanced_brace_substring(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let bytes = text.as_bytes();
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &byte) in bytes[start..].iter().enumerate() {
        let ch = byte as char;
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(text[start..=start + offset].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Classification {
        label: String,
        confidence: f32,
    }

    #[test]
    fn extracts_raw_json() {
        let raw = r#"{"label":"fact","confidence":0.9}"#;
        let out: Classification = extract_json_output(raw).unwrap();
        assert_eq!(out.label, "fact");
    }

    #[test]
    fn extracts_fenced_json_with_surrounding_prose() {
        let raw = "Sure, here you go:\n```json\n{\"label\":\"fact\",\"confidence\":0.7}\n```\nLet me know if that helps.";
        let out: Classification = extract_json_output(raw).unwrap();
        assert_eq!(out.label, "fact");
        assert_eq!(out.confidence, 0.7);
    }

    #[test]
    fn extracts_fenced_json_with_no_language_tag() {
        let raw = "```\n{\"label\":\"fact\",\"confidence\":0.6}\n```";
        let out: Classification = extract_json_output(raw).unwrap();
        assert_eq!(out.label, "fact");
        assert_eq!(out.confidence, 0.6);
    }

    #[test]
    fn extracts_bare_braces_with_trailing_prose_braces() {
        let raw = "Result: {\"label\":\"fact\",\"confidence\":0.5} (note: {unrelated})";
        let out: Classification = extract_json_output(raw).unwrap();
        assert_eq!(out.label, "fact");
    }

    #[test]
    fn returns_none_when_nothing_parses() {
        let out: Option<Classification> = extract_json_output("no json here at all");
        assert!(out.is_none());
    }

    #[test]
    fn tolerates_braces_inside_string_values() {
        let raw = r#"{"label":"a { weird } label","confidence":0.3}"#;
        let out: Classification = extract_json_output(raw).unwrap();
        assert_eq!(out.label, "a { weird } label");
    }
}
