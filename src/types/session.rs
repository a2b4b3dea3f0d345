//! Session-related types: status, backend kind and token usage

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle status of a provider session
///
/// `starting → idle ⇄ running ⇄ waiting_approval → idle`; any state falls
/// back to `idle` on stop or process exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Bootstrapping the backend
    #[default]
    Starting,
    /// Waiting for the next input
    Idle,
    /// A turn is in progress
    Running,
    /// A gated tool call is waiting for a caller decision
    WaitingApproval,
}

impl SessionStatus {
    /// Convert to the wire string
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Idle => "idle",
            Self::Running => "running",
            Self::WaitingApproval => "waiting_approval",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which backend protocol family drives a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// SDK-delegate-driven agent
    #[default]
    Claude,
    /// JSON-RPC app-server
    Codex,
}

impl BackendKind {
    /// Parse from string
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "claude" => Some(Self::Claude),
            "codex" => Some(Self::Codex),
            _ => None,
        }
    }

    /// Convert to string
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::Codex => "codex",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Token usage statistics
///
/// Tracks the number of tokens used in one turn.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    /// Number of input tokens
    pub input_tokens: u64,

    /// Number of output tokens
    pub output_tokens: u64,

    /// Number of tokens read from cache
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_read_input_tokens: Option<u64>,

    /// Number of tokens written to cache
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_creation_input_tokens: Option<u64>,
}

impl TokenUsage {
    /// Create a new empty token usage
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from the SDK's snake_case usage object
    ///
    /// # Arguments
    ///
    /// * `usage` - The `usage` field of a result message
    pub fn from_sdk_usage(usage: &serde_json::Value) -> Self {
        Self {
            input_tokens: usage["input_tokens"].as_u64().unwrap_or(0),
            output_tokens: usage["output_tokens"].as_u64().unwrap_or(0),
            cache_read_input_tokens: usage["cache_read_input_tokens"].as_u64(),
            cache_creation_input_tokens: usage["cache_creation_input_tokens"].as_u64(),
        }
    }

    /// Parse from an app-server `thread/tokenUsage/updated` payload
    ///
    /// Prefers the `last` breakdown (the most recent turn) over `total`.
    pub fn from_rpc_usage(params: &serde_json::Value) -> Option<Self> {
        let usage = params.get("tokenUsage")?;
        let breakdown = usage.get("last").or_else(|| usage.get("total"))?;
        Some(Self {
            input_tokens: breakdown["inputTokens"].as_u64().unwrap_or(0),
            output_tokens: breakdown["outputTokens"].as_u64().unwrap_or(0),
            cache_read_input_tokens: breakdown["cachedInputTokens"].as_u64(),
            cache_creation_input_tokens: None,
        })
    }

    /// Add another usage to this one
    pub fn add(&mut self, other: &TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;

        if let Some(v) = other.cache_read_input_tokens {
            *self.cache_read_input_tokens.get_or_insert(0) += v;
        }
        if let Some(v) = other.cache_creation_input_tokens {
            *self.cache_creation_input_tokens.get_or_insert(0) += v;
        }
    }

    /// Get total token count (input + output)
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    /// Check if any tokens were used
    pub fn is_empty(&self) -> bool {
        self.input_tokens == 0 && self.output_tokens == 0
    }
}
