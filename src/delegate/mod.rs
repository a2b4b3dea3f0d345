//! Delegate backends
//!
//! The delegate-variant session drives a conversation through an
//! [`AgentQuery`]. [`ClaudeQuery`] is the production implementation on top
//! of the Claude Agent SDK; tests script their own.

mod claude;
mod query;

pub use claude::ClaudeQuery;
pub use query::{
    AgentConnection, AgentQuery, GateDecision, GateRequest, PermissionGate, QueryRequest,
};
