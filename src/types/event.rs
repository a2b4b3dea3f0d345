//! Uniform event contract emitted by every provider session
//!
//! Both backend families translate their native messages into
//! [`ProviderEvent`]. Sessions push them, together with lifecycle signals,
//! onto an ordered outbound queue as [`SessionEvent`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::session::{SessionStatus, TokenUsage};

/// One message of the uniform event contract
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProviderEvent {
    /// Backend lifecycle information (e.g. `init`)
    System(SystemEvent),
    /// A complete assistant message
    Assistant(AssistantEvent),
    /// Result of a tool invocation
    ToolResult(ToolResultEvent),
    /// End of a turn
    Result(ResultEvent),
    /// Something went wrong
    Error(ErrorEvent),
    /// Session status change
    Status { status: SessionStatus },
    /// A gated tool call waiting for a caller decision
    PermissionRequest(PermissionRequestEvent),
    /// Incremental assistant text
    StreamDelta { text: String },
    /// Incremental reasoning text
    ThinkingDelta { text: String },
    /// Echo of caller input
    UserInput(UserInputEvent),
    /// Backend-generated summary of preceding tool calls
    ToolUseSummary(ToolUseSummaryEvent),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemEvent {
    pub subtype: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slash_commands: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skills: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssistantEvent {
    /// `{ "role": "assistant", "content": [blocks...] }`
    pub message: Value,
    /// Stable per-message id from the backend transcript
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
}

impl AssistantEvent {
    /// Assistant message with a single text block
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            message: serde_json::json!({
                "role": "assistant",
                "content": [{"type": "text", "text": text.into()}]
            }),
            uuid: None,
        }
    }

    /// Assistant message with a single tool_use block
    pub fn tool_use(id: impl Into<String>, name: impl Into<String>, input: Value) -> Self {
        Self {
            message: serde_json::json!({
                "role": "assistant",
                "content": [{
                    "type": "tool_use",
                    "id": id.into(),
                    "name": name.into(),
                    "input": input
                }]
            }),
            uuid: None,
        }
    }

    /// Iterate over `(id, name)` of every tool_use block
    pub fn tool_uses(&self) -> impl Iterator<Item = (&str, &str)> {
        self.message
            .get("content")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter(|block| block.get("type").and_then(Value::as_str) == Some("tool_use"))
            .filter_map(|block| {
                Some((
                    block.get("id")?.as_str()?,
                    block.get("name")?.as_str()?,
                ))
            })
    }
}

/// Reference to an image registered with an external store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageRef {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResultEvent {
    pub tool_use_id: String,
    pub content: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<ImageRef>>,
    #[serde(default)]
    pub is_error: bool,
    /// Raw backend content blocks, consumed by enrichment and never forwarded
    #[serde(skip)]
    pub raw_blocks: Option<Vec<Value>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultEvent {
    /// `success`, `error`, `interrupted` or a backend-specific subtype
    pub subtype: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<TokenUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_edits: Option<u32>,
}

impl ResultEvent {
    pub fn is_success(&self) -> bool {
        self.subtype == "success"
    }
}

/// Severity of an `error` event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Recoverable, the session keeps running
    Warning,
    #[default]
    Error,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEvent {
    pub message: String,
    #[serde(default)]
    pub severity: Severity,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRequestEvent {
    pub tool_use_id: String,
    pub tool_name: String,
    pub input: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInputEvent {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_message_uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_count: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolUseSummaryEvent {
    pub summary: String,
    #[serde(default)]
    pub preceding_tool_use_ids: Vec<String>,
}

impl ProviderEvent {
    /// Wire name of this event kind
    pub fn kind(&self) -> &'static str {
        match self {
            Self::System(_) => "system",
            Self::Assistant(_) => "assistant",
            Self::ToolResult(_) => "tool_result",
            Self::Result(_) => "result",
            Self::Error(_) => "error",
            Self::Status { .. } => "status",
            Self::PermissionRequest(_) => "permission_request",
            Self::StreamDelta { .. } => "stream_delta",
            Self::ThinkingDelta { .. } => "thinking_delta",
            Self::UserInput(_) => "user_input",
            Self::ToolUseSummary(_) => "tool_use_summary",
        }
    }

    /// Streaming deltas are forwarded but never buffered in history
    pub fn is_streaming_delta(&self) -> bool {
        matches!(self, Self::StreamDelta { .. } | Self::ThinkingDelta { .. })
    }

    /// Stable message uuid carried by user/assistant messages
    pub fn uuid(&self) -> Option<&str> {
        match self {
            Self::UserInput(input) => input.user_message_uuid.as_deref(),
            Self::Assistant(assistant) => assistant.uuid.as_deref(),
            _ => None,
        }
    }

    pub fn status(status: SessionStatus) -> Self {
        Self::Status { status }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(ErrorEvent {
            message: message.into(),
            severity: Severity::Error,
        })
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::Error(ErrorEvent {
            message: message.into(),
            severity: Severity::Warning,
        })
    }

    pub fn user_input(text: impl Into<String>, image_count: usize) -> Self {
        Self::UserInput(UserInputEvent {
            text: text.into(),
            user_message_uuid: None,
            image_count: (image_count > 0).then_some(image_count),
        })
    }

    pub fn permission_request(
        tool_use_id: impl Into<String>,
        tool_name: impl Into<String>,
        input: Value,
    ) -> Self {
        Self::PermissionRequest(PermissionRequestEvent {
            tool_use_id: tool_use_id.into(),
            tool_name: tool_name.into(),
            input,
        })
    }
}

/// An inline image attached to caller input
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageAttachment {
    /// MIME type, e.g. `image/png`
    pub media_type: String,
    /// Base64-encoded bytes
    pub data: String,
}

/// Item on a session's ordered outbound queue
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A uniform contract message
    Message(ProviderEvent),
    /// The backend process or handle is gone
    Exit { code: Option<i32> },
}

impl From<ProviderEvent> for SessionEvent {
    fn from(event: ProviderEvent) -> Self {
        Self::Message(event)
    }
}
