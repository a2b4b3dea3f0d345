//! Hub configuration from environment variables, and per-session start options

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default bound on a pending RPC call
const DEFAULT_RPC_TIMEOUT_MS: u64 = 120_000;
/// Default history cap per session
const DEFAULT_HISTORY_LIMIT: usize = 100;
/// Default fallback before a delegate session is forced idle
const DEFAULT_INIT_FALLBACK_MS: u64 = 3_000;

/// Hub configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Path to the JSON-RPC app-server binary
    /// Environment variable: `AGENT_HUB_CODEX_PATH`
    pub codex_path: String,

    /// Upper bound on how long an RPC request may stay pending.
    /// `None` disables the bound.
    /// Environment variable: `AGENT_HUB_RPC_TIMEOUT_MS` (0 disables)
    pub rpc_timeout: Option<Duration>,

    /// Maximum number of buffered history entries per session
    /// Environment variable: `AGENT_HUB_HISTORY_LIMIT`
    pub history_limit: usize,

    /// Delay after which a delegate session leaves `starting` without init
    /// Environment variable: `AGENT_HUB_INIT_FALLBACK_MS`
    pub init_fallback: Duration,

    /// Root of the backend's per-project transcript directories
    /// Environment variable: `AGENT_HUB_CLAUDE_PROJECTS_DIR`
    pub claude_projects_dir: PathBuf,

    /// Directory where image attachments are materialized
    /// Environment variable: `AGENT_HUB_IMAGE_DIR`
    pub image_temp_dir: PathBuf,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            codex_path: "codex".to_string(),
            rpc_timeout: Some(Duration::from_millis(DEFAULT_RPC_TIMEOUT_MS)),
            history_limit: DEFAULT_HISTORY_LIMIT,
            init_fallback: Duration::from_millis(DEFAULT_INIT_FALLBACK_MS),
            claude_projects_dir: default_claude_projects_dir(),
            image_temp_dir: std::env::temp_dir().join("agent-hub-images"),
        }
    }
}

impl HubConfig {
    /// Create the default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from environment variables
    ///
    /// Unset or unparsable variables fall back to their defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let rpc_timeout = match env_u64("AGENT_HUB_RPC_TIMEOUT_MS") {
            Some(0) => None,
            Some(ms) => Some(Duration::from_millis(ms)),
            None => defaults.rpc_timeout,
        };

        Self {
            codex_path: std::env::var("AGENT_HUB_CODEX_PATH").unwrap_or(defaults.codex_path),
            rpc_timeout,
            history_limit: env_u64("AGENT_HUB_HISTORY_LIMIT")
                .and_then(|v| usize::try_from(v).ok())
                .filter(|v| *v > 0)
                .unwrap_or(defaults.history_limit),
            init_fallback: env_u64("AGENT_HUB_INIT_FALLBACK_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.init_fallback),
            claude_projects_dir: std::env::var("AGENT_HUB_CLAUDE_PROJECTS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.claude_projects_dir),
            image_temp_dir: std::env::var("AGENT_HUB_IMAGE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.image_temp_dir),
        }
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|s| s.trim().parse::<u64>().ok())
}

fn default_claude_projects_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".claude")
        .join("projects")
}

/// Collaboration mode of an RPC-variant session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CollaborationMode {
    /// Normal execution
    #[default]
    Default,
    /// Plan first, execute after approval
    Plan,
}

impl CollaborationMode {
    /// Parse from the wire string
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "default" => Some(Self::Default),
            "plan" => Some(Self::Plan),
            _ => None,
        }
    }

    /// Convert to the wire string
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Plan => "plan",
        }
    }
}

/// Options applied when a session starts
///
/// Fields a backend does not understand are ignored by that backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartOptions {
    /// Model identifier
    #[serde(default)]
    pub model: Option<String>,

    /// Reasoning effort (e.g. "low", "medium", "high")
    #[serde(default)]
    pub effort: Option<String>,

    /// Permission / approval mode passed to the backend
    #[serde(default)]
    pub permission_mode: Option<String>,

    /// Sandbox mode (e.g. "workspace-write")
    #[serde(default)]
    pub sandbox_mode: Option<String>,

    /// Allow network access inside the sandbox
    #[serde(default)]
    pub network_access: Option<bool>,

    /// Allow the web search tool
    #[serde(default)]
    pub web_search: Option<bool>,

    /// Collaboration mode (RPC variant)
    #[serde(default)]
    pub collaboration_mode: CollaborationMode,

    /// Backend session / thread id to resume
    #[serde(default)]
    pub resume: Option<String>,

    /// Resume the conversation as of this assistant message uuid
    #[serde(default)]
    pub resume_at: Option<String>,

    /// Extra text appended to the system prompt
    #[serde(default)]
    pub system_prompt_append: Option<String>,
}

impl StartOptions {
    /// Options resuming a backend session
    pub fn with_resume(session_id: impl Into<String>) -> Self {
        Self {
            resume: Some(session_id.into()),
            ..Default::default()
        }
    }
}
