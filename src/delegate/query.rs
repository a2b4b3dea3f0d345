//! The agent-query seam
//!
//! A delegate backend is opened once per session and then driven one turn at
//! a time. Messages use the backend CLI's stream-json shapes (`system`,
//! `assistant`, `user`, `result`, `stream_event`, `tool_use_summary`).

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::session::{TurnCounters, TurnInput};
use crate::types::{Result, StartOptions};

/// One gated tool call awaiting a decision
#[derive(Debug, Clone)]
pub struct GateRequest {
    /// Backend-supplied correlation id, reused as the tool-use id
    pub correlation_id: String,
    pub tool_name: String,
    pub input: Value,
    /// Fires when the backend gives up waiting; the call is then denied
    pub abort: CancellationToken,
}

/// Verdict returned to the backend
#[derive(Debug, Clone, PartialEq)]
pub enum GateDecision {
    Allow { updated_input: Option<Value> },
    Deny { message: String },
}

impl GateDecision {
    pub fn allow() -> Self {
        Self::Allow {
            updated_input: None,
        }
    }

    pub fn deny(message: impl Into<String>) -> Self {
        Self::Deny {
            message: message.into(),
        }
    }
}

/// Callback invoked before every gated tool call
pub type PermissionGate = Arc<dyn Fn(GateRequest) -> BoxFuture<'static, GateDecision> + Send + Sync>;

/// Everything a backend needs to open a conversation
pub struct QueryRequest {
    pub cwd: PathBuf,
    pub options: StartOptions,
    pub gate: PermissionGate,
    /// Fed by the backend's post-tool-use hook
    pub counters: Arc<TurnCounters>,
    /// Where image attachments are written when the backend needs files
    pub image_dir: PathBuf,
}

impl fmt::Debug for QueryRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryRequest")
            .field("cwd", &self.cwd)
            .field("options", &self.options)
            .field("image_dir", &self.image_dir)
            .finish_non_exhaustive()
    }
}

/// Opens delegate conversations
#[async_trait]
pub trait AgentQuery: Send + Sync + fmt::Debug {
    async fn open(&self, request: QueryRequest) -> Result<Arc<dyn AgentConnection>>;
}

/// An open delegate conversation
#[async_trait]
pub trait AgentConnection: Send + Sync {
    /// Submit one user turn
    async fn send(&self, input: TurnInput) -> Result<()>;

    /// Messages of the current turn; ends after its `result`
    fn receive_turn(&self) -> BoxStream<'_, Result<Value>>;

    /// Ask the backend to stop the running turn
    async fn interrupt(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;
}
