//! Chat completion provider
//!
//! Message and content-block types shared with the agent, the [`ChatClient`]
//! seam, and an Anthropic-compatible HTTP implementation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub mod anthropic;

pub use anthropic::AnthropicClient;

/// Chat client errors
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("upstream error (status {status}): {body}")]
    Upstream { status: u16, body: String },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("request timeout after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("request cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, ProviderError>;

/// Conversation role. System instructions travel separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One structured piece of message content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
    /// Block types this client does not model (thinking, images, ...)
    #[serde(other)]
    Unsupported,
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn tool_use(id: impl Into<String>, name: impl Into<String>, input: Value) -> Self {
        Self::ToolUse {
            id: id.into(),
            name: name.into(),
            input,
        }
    }
}

/// A conversation turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: vec![ContentBlock::text(text)],
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: vec![ContentBlock::text(text)],
        }
    }

    /// Assistant turn echoing raw model content. Unsupported blocks are dropped
    /// so the message can be sent back to the provider.
    pub fn assistant_blocks(content: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::Assistant,
            content: content
                .into_iter()
                .filter(|b| !matches!(b, ContentBlock::Unsupported))
                .collect(),
        }
    }

    /// User turn wrapping every tool result of one iteration
    pub fn tool_results(results: &[ToolResult]) -> Self {
        Self {
            role: Role::User,
            content: results.iter().map(ToolResult::to_block).collect(),
        }
    }

    /// Concatenated text blocks
    pub fn text(&self) -> String {
        collect_text(&self.content)
    }
}

fn collect_text(blocks: &[ContentBlock]) -> String {
    blocks
        .iter()
        .filter_map(|b| match b {
            ContentBlock::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect()
}

/// Tool invocation requested by the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub input: Value,
}

/// Outcome of one [`ToolCall`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_use_id: String,
    pub content: Value,
    pub is_error: bool,
}

impl ToolResult {
    pub fn success(tool_use_id: impl Into<String>, content: Value) -> Self {
        Self {
            tool_use_id: tool_use_id.into(),
            content,
            is_error: false,
        }
    }

    pub fn error(tool_use_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            tool_use_id: tool_use_id.into(),
            content: serde_json::json!({ "error": message.into() }),
            is_error: true,
        }
    }

    /// Wire block; string content is passed through, anything else is JSON-encoded
    pub fn to_block(&self) -> ContentBlock {
        let content = match &self.content {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        ContentBlock::ToolResult {
            tool_use_id: self.tool_use_id.clone(),
            content,
            is_error: self.is_error.then_some(true),
        }
    }
}

/// Tool specification exported to the model. Never carries a handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

impl ToolDefinition {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
        }
    }
}

/// Token accounting for one response
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u32,
    #[serde(default)]
    pub output_tokens: u32,
}

impl Usage {
    pub fn total(&self) -> u64 {
        u64::from(self.input_tokens) + u64::from(self.output_tokens)
    }
}

/// Parameters of one chat call
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub system_prompt: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    pub max_tokens: u32,
    pub temperature: Option<f32>,
}

impl Default for ChatRequest {
    fn default() -> Self {
        Self {
            system_prompt: String::new(),
            messages: Vec::new(),
            tools: Vec::new(),
            max_tokens: 4096,
            temperature: Some(0.3),
        }
    }
}

pub const STOP_TOOL_USE: &str = "tool_use";
pub const STOP_END_TURN: &str = "end_turn";

/// Model reply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
    #[serde(default)]
    pub stop_reason: String,
    #[serde(default)]
    pub usage: Usage,
}

impl ChatResponse {
    /// Final text answer
    pub fn end_turn(text: impl Into<String>) -> Self {
        Self {
            content: vec![ContentBlock::text(text)],
            stop_reason: STOP_END_TURN.to_string(),
            usage: Usage::default(),
        }
    }

    /// Response requesting the given tool calls
    pub fn tool_use(calls: Vec<ToolCall>) -> Self {
        Self {
            content: calls
                .into_iter()
                .map(|c| ContentBlock::tool_use(c.id, c.name, c.input))
                .collect(),
            stop_reason: STOP_TOOL_USE.to_string(),
            usage: Usage::default(),
        }
    }

    pub fn with_usage(mut self, input_tokens: u32, output_tokens: u32) -> Self {
        self.usage = Usage {
            input_tokens,
            output_tokens,
        };
        self
    }

    pub fn has_tool_use(&self) -> bool {
        self.stop_reason == STOP_TOOL_USE
    }

    pub fn is_end_turn(&self) -> bool {
        self.stop_reason == STOP_END_TURN
    }

    /// All tool-use blocks, in response order
    pub fn tool_calls(&self) -> Vec<ToolCall> {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolUse { id, name, input } => Some(ToolCall {
                    id: id.clone(),
                    name: name.clone(),
                    input: input.clone(),
                }),
                _ => None,
            })
            .collect()
    }

    /// All text blocks concatenated in order
    pub fn text(&self) -> String {
        collect_text(&self.content)
    }
}

/// Remote chat-completion endpoint
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// One request/response exchange. Must abort with
    /// [`ProviderError::Cancelled`] once `cancel` fires.
    async fn chat_with_tools(
        &self,
        cancel: &CancellationToken,
        request: ChatRequest,
    ) -> Result<ChatResponse>;

    fn default_model(&self) -> String;

    /// False when the client answers from its offline mock
    fn is_configured(&self) -> bool;
}

#[async_trait]
impl<C: ChatClient + ?Sized> ChatClient for Arc<C> {
    async fn chat_with_tools(
        &self,
        cancel: &CancellationToken,
        request: ChatRequest,
    ) -> Result<ChatResponse> {
        (**self).chat_with_tools(cancel, request).await
    }

    fn default_model(&self) -> String {
        (**self).default_model()
    }

    fn is_configured(&self) -> bool {
        (**self).is_configured()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_provider_error_display() {
        let err = ProviderError::Upstream {
            status: 500,
            body: "boom".to_string(),
        };
        assert_eq!(err.to_string(), "upstream error (status 500): boom");

        let err = ProviderError::Timeout(Duration::from_secs(120));
        assert_eq!(err.to_string(), "request timeout after 120s");

        assert_eq!(ProviderError::Cancelled.to_string(), "request cancelled");
    }

    #[test]
    fn test_response_helpers() {
        let response = ChatResponse {
            content: vec![
                ContentBlock::text("Let me "),
                ContentBlock::tool_use("tu_1", "list_blocks", json!({})),
                ContentBlock::text("check."),
                ContentBlock::tool_use("tu_2", "get_block", json!({"id": "b1"})),
            ],
            stop_reason: STOP_TOOL_USE.to_string(),
            usage: Usage::default(),
        };

        assert!(response.has_tool_use());
        assert!(!response.is_end_turn());
        assert_eq!(response.text(), "Let me check.");

        let calls = response.tool_calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].id, "tu_1");
        assert_eq!(calls[1].name, "get_block");
        assert_eq!(calls[1].input, json!({"id": "b1"}));
    }

    #[test]
    fn test_other_stop_reason_is_neither() {
        let mut response = ChatResponse::end_turn("partial");
        response.stop_reason = "max_tokens".to_string();
        assert!(!response.has_tool_use());
        assert!(!response.is_end_turn());
    }

    #[test]
    fn test_usage_total() {
        let usage = Usage {
            input_tokens: 10,
            output_tokens: 32,
        };
        assert_eq!(usage.total(), 42);
    }

    #[test]
    fn test_content_block_wire_shape() {
        let block = ContentBlock::tool_use("tu_1", "search_docs", json!({"q": "cron"}));
        let value = serde_json::to_value(&block).unwrap();
        assert_eq!(
            value,
            json!({"type": "tool_use", "id": "tu_1", "name": "search_docs", "input": {"q": "cron"}})
        );

        let block = ContentBlock::text("hi");
        assert_eq!(
            serde_json::to_value(&block).unwrap(),
            json!({"type": "text", "text": "hi"})
        );
    }

    #[test]
    fn test_unknown_block_type_decodes_as_unsupported() {
        let block: ContentBlock =
            serde_json::from_value(json!({"type": "thinking", "thinking": "hmm"})).unwrap();
        assert_eq!(block, ContentBlock::Unsupported);
    }

    #[test]
    fn test_assistant_blocks_drops_unsupported() {
        let msg = Message::assistant_blocks(vec![
            ContentBlock::Unsupported,
            ContentBlock::text("ok"),
        ]);
        assert_eq!(msg.role, Role::Assistant);
        assert_eq!(msg.content, vec![ContentBlock::text("ok")]);
    }

    #[test]
    fn test_tool_result_block_encoding() {
        let ok = ToolResult::success("tu_1", json!({"blocks": ["http"]}));
        match ok.to_block() {
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => {
                assert_eq!(tool_use_id, "tu_1");
                assert_eq!(content, r#"{"blocks":["http"]}"#);
                assert_eq!(is_error, None);
            }
            other => panic!("unexpected block {:?}", other),
        }

        let text = ToolResult::success("tu_2", json!("plain"));
        match text.to_block() {
            ContentBlock::ToolResult { content, .. } => assert_eq!(content, "plain"),
            other => panic!("unexpected block {:?}", other),
        }

        let failed = ToolResult::error("tu_3", "boom");
        let value = serde_json::to_value(failed.to_block()).unwrap();
        assert_eq!(value["type"], "tool_result");
        assert_eq!(value["is_error"], true);
        assert_eq!(value["content"], r#"{"error":"boom"}"#);
    }

    #[test]
    fn test_tool_results_message_keeps_order() {
        let results = vec![
            ToolResult::success("a", json!(1)),
            ToolResult::error("b", "bad"),
        ];
        let msg = Message::tool_results(&results);
        assert_eq!(msg.role, Role::User);
        let ids: Vec<&str> = msg
            .content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolResult { tool_use_id, .. } => Some(tool_use_id.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_tool_definition_has_no_handler_field() {
        let def = ToolDefinition::new("list_blocks", "List blocks", json!({"type": "object"}));
        let value = serde_json::to_value(&def).unwrap();
        let keys: Vec<&String> = value.as_object().unwrap().keys().collect();
        assert_eq!(keys.len(), 3);
        assert_eq!(value["input_schema"]["type"], "object");
    }

    #[test]
    fn test_message_text() {
        let msg = Message::user("hello");
        assert_eq!(msg.text(), "hello");
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["role"], "user");
        assert_eq!(value["content"][0]["type"], "text");
    }
}
