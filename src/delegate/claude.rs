//! Claude SDK backed delegate
//!
//! Each conversation owns one `ClaudeClient`. Tool permissions go through the
//! SDK's `can_use_tool` callback, which defers to the session's gate.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use claude_code_agent_sdk::types::permissions::{
    CanUseToolCallback, PermissionResult, PermissionResultAllow, PermissionResultDeny,
    ToolPermissionContext,
};
use claude_code_agent_sdk::{
    ClaudeAgentOptions, ClaudeClient, HookEvent, HookMatcher, SystemPrompt, SystemPromptPreset,
};
use futures::StreamExt;
use futures::stream::BoxStream;
use serde_json::Value;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::hooks::create_post_tool_use_hook;
use crate::session::{TurnInput, materialize_images};
use crate::types::{AgentError, Result, StartOptions};

use super::query::{
    AgentConnection, AgentQuery, GateDecision, GateRequest, PermissionGate, QueryRequest,
};

/// Extra CLI flag naming the message to resume at
const RESUME_AT_FLAG: &str = "resume-session-at";

/// Thinking budget for an effort level
fn thinking_tokens(effort: &str) -> Option<u32> {
    match effort {
        "low" => Some(4_000),
        "medium" => Some(10_000),
        "high" | "xhigh" => Some(32_000),
        _ => None,
    }
}

/// Opens conversations through the Claude Agent SDK
#[derive(Debug, Clone, Default)]
pub struct ClaudeQuery {
    /// Extra environment for the CLI process
    env: HashMap<String, String>,
    fallback_model: Option<String>,
}

impl ClaudeQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_fallback_model(mut self, model: impl Into<String>) -> Self {
        self.fallback_model = Some(model.into());
        self
    }

    fn build_options(&self, request: &QueryRequest, abort: &CancellationToken) -> ClaudeAgentOptions {
        let mut hooks_map: HashMap<HookEvent, Vec<HookMatcher>> = HashMap::new();
        hooks_map.insert(
            HookEvent::PostToolUse,
            vec![
                HookMatcher::builder()
                    .hooks(vec![create_post_tool_use_hook(Arc::clone(&request.counters))])
                    .build(),
            ],
        );

        let mut options = ClaudeAgentOptions::builder()
            .cwd(request.cwd.clone())
            .hooks(hooks_map)
            .build();

        apply_start_options(&mut options, &request.options);
        if let Some(ref fallback) = self.fallback_model {
            options.fallback_model = Some(fallback.clone());
        }
        if !self.env.is_empty() {
            options.env.clone_from(&self.env);
        }
        options.can_use_tool = Some(create_can_use_tool_callback(
            Arc::clone(&request.gate),
            abort.clone(),
        ));
        options
    }
}

fn apply_start_options(options: &mut ClaudeAgentOptions, start: &StartOptions) {
    if let Some(ref model) = start.model {
        options.model = Some(model.clone());
    }
    if let Some(tokens) = start.effort.as_deref().and_then(thinking_tokens) {
        options.max_thinking_tokens = Some(tokens);
    }
    if let Some(ref append) = start.system_prompt_append {
        let preset = SystemPromptPreset::with_append("claude_code", append);
        options.system_prompt = Some(SystemPrompt::Preset(preset));
    }
    if let Some(ref resume) = start.resume {
        options.resume = Some(resume.clone());
        if let Some(ref resume_at) = start.resume_at {
            options
                .extra_args
                .insert(RESUME_AT_FLAG.to_string(), Some(resume_at.clone()));
        }
    }
}

/// Bridge the SDK's permission callback onto the session gate
///
/// The SDK does not hand us the tool-use id, so each call gets a fresh
/// correlation id.
///
/// The SDK exposes no per-request cancellation either. `abort` is a child of
/// the connection token and fires only when the connection closes. A request
/// the SDK gives up on drops this future, and the gate withdraws its pending
/// approval on drop.
fn create_can_use_tool_callback(gate: PermissionGate, abort: CancellationToken) -> CanUseToolCallback {
    Arc::new(
        move |tool_name: String, tool_input: Value, _context: ToolPermissionContext| {
            let gate = Arc::clone(&gate);
            let abort = abort.child_token();

            Box::pin(async move {
                let correlation_id = format!("toolu_gate_{}", uuid::Uuid::new_v4().simple());
                tracing::debug!(
                    tool_name = %tool_name,
                    correlation_id = %correlation_id,
                    "can_use_tool callback called"
                );

                let decision = gate(GateRequest {
                    correlation_id,
                    tool_name,
                    input: tool_input,
                    abort,
                })
                .await;

                match decision {
                    GateDecision::Allow { updated_input } => {
                        PermissionResult::Allow(PermissionResultAllow {
                            updated_input,
                            ..Default::default()
                        })
                    }
                    GateDecision::Deny { message } => {
                        PermissionResult::Deny(PermissionResultDeny {
                            message,
                            interrupt: false,
                        })
                    }
                }
            })
        },
    )
}

#[async_trait]
impl AgentQuery for ClaudeQuery {
    async fn open(&self, request: QueryRequest) -> Result<Arc<dyn AgentConnection>> {
        let abort = CancellationToken::new();
        let options = self.build_options(&request, &abort);

        let mut client = ClaudeClient::new(options);
        client.connect().await.map_err(AgentError::from)?;
        tracing::info!(cwd = %request.cwd.display(), "Connected to Claude CLI");

        Ok(Arc::new(ClaudeConnection {
            client: RwLock::new(client),
            image_dir: request.image_dir,
            abort,
        }))
    }
}

/// One open SDK conversation
struct ClaudeConnection {
    client: RwLock<ClaudeClient>,
    image_dir: PathBuf,
    /// Cancelled on close; denies any permission call still waiting
    abort: CancellationToken,
}

/// Append image file references to the prompt text
fn prompt_with_images(text: &str, paths: &[PathBuf]) -> String {
    if paths.is_empty() {
        return text.to_string();
    }
    let mut prompt = text.to_string();
    for path in paths {
        prompt.push_str(&format!("\n\n[Image: {}]", path.display()));
    }
    prompt
}

impl ClaudeConnection {
    async fn prompt_text(&self, input: &TurnInput) -> Result<String> {
        let paths = materialize_images(Path::new(&self.image_dir), &input.images).await?;
        Ok(prompt_with_images(&input.text, &paths))
    }
}

#[async_trait]
impl AgentConnection for ClaudeConnection {
    async fn send(&self, input: TurnInput) -> Result<()> {
        let text = self.prompt_text(&input).await?;
        let mut client = self.client.write().await;
        client.query(&text).await.map_err(AgentError::from)
    }

    fn receive_turn(&self) -> BoxStream<'_, Result<Value>> {
        async_stream::stream! {
            let client = self.client.read().await;
            let mut stream = client.receive_response();
            while let Some(message) = stream.next().await {
                yield match message {
                    Ok(message) => serde_json::to_value(&message).map_err(AgentError::from),
                    Err(e) => Err(AgentError::from(e)),
                };
            }
        }
        .boxed()
    }

    async fn interrupt(&self) -> Result<()> {
        let client = self.client.read().await;
        client.interrupt().await.map_err(AgentError::from)
    }

    async fn close(&self) -> Result<()> {
        self.abort.cancel();
        let mut client = self.client.write().await;
        client.disconnect().await.map_err(AgentError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thinking_tokens_by_effort() {
        assert_eq!(thinking_tokens("low"), Some(4_000));
        assert_eq!(thinking_tokens("medium"), Some(10_000));
        assert_eq!(thinking_tokens("high"), Some(32_000));
        assert_eq!(thinking_tokens("none"), None);
    }

    #[test]
    fn test_prompt_with_images() {
        assert_eq!(prompt_with_images("hi", &[]), "hi");
        let prompt = prompt_with_images("look", &[PathBuf::from("/tmp/a.png")]);
        assert_eq!(prompt, "look\n\n[Image: /tmp/a.png]");
    }

    #[test]
    fn test_apply_start_options() {
        let mut options = ClaudeAgentOptions::builder()
            .cwd(PathBuf::from("/tmp"))
            .hooks(HashMap::new())
            .build();
        apply_start_options(
            &mut options,
            &StartOptions {
                model: Some("opus".to_string()),
                effort: Some("medium".to_string()),
                resume: Some("sess-1".to_string()),
                ..Default::default()
            },
        );
        assert_eq!(options.model.as_deref(), Some("opus"));
        assert_eq!(options.max_thinking_tokens, Some(10_000));
        assert_eq!(options.resume.as_deref(), Some("sess-1"));
    }
}
