//! Agent Hub
//!
//! Process orchestration for coding-agent backends. Two protocol families sit
//! behind one session contract:
//!
//! - JSON-RPC app-servers spoken to over subprocess stdio
//! - SDK-driven agents, where the conversation is delegated to a message
//!   stream plus a permission callback
//!
//! ## Features
//!
//! - Uniform event contract ([`ProviderEvent`]) with an ordered per-session queue
//! - Approval gate with session-scoped allow-rules
//! - Session manager with bounded history, enrichment, transcript UUID
//!   backfill, rewind and worktree mapping
//!
//! ## Quick Start
//!
//! ```no_run
//! use agent_hub::{BackendKind, CreateRequest, SessionManager};
//!
//! #[tokio::main]
//! async fn main() -> agent_hub::Result<()> {
//!     let (manager, mut events) = SessionManager::builder().build();
//!     let id = manager
//!         .create(CreateRequest::new("/path/to/project", BackendKind::Codex))
//!         .await?;
//!     manager.send_input(&id, "List the failing tests", Vec::new());
//!     while let Some(event) = events.recv().await {
//!         println!("{event:?}");
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Environment Variables
//!
//! - `AGENT_HUB_CODEX_PATH`: app-server binary (default: `codex`)
//! - `AGENT_HUB_RPC_TIMEOUT_MS`: bound on a pending RPC call, 0 disables (default: 120000)
//! - `AGENT_HUB_HISTORY_LIMIT`: history entries kept per session (default: 100)
//! - `AGENT_HUB_INIT_FALLBACK_MS`: delegate init fallback (default: 3000)
//! - `AGENT_HUB_CLAUDE_PROJECTS_DIR`: transcript root (default: `~/.claude/projects`)
//! - `AGENT_HUB_IMAGE_DIR`: where image attachments are written

pub mod cli;
pub mod delegate;
pub mod hooks;
pub mod manager;
pub mod rpc;
pub mod runner;
pub mod session;
pub mod settings;
pub mod tracing;
pub mod types;

pub use cli::Cli;
pub use delegate::{AgentQuery, ClaudeQuery};
pub use hooks::create_post_tool_use_hook;
pub use manager::{
    CreateRequest, HubEvent, ManagerOutcome, SessionManager, SessionManagerBuilder,
    SessionSummary,
};
pub use runner::{run_with_cli, shutdown_otel};
pub use session::{DelegateSession, ProviderSession, RpcSession};
pub use settings::{SessionRules, build_session_rule, matches_session_rule};
pub use types::{
    AgentError, BackendKind, HubConfig, ProviderEvent, Result, SessionStatus, StartOptions,
};
