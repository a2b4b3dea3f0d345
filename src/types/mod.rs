//! Public types for the agent hub
//!
//! This module contains all the shared types used across the crate.

mod config;
mod error;
mod event;
mod session;

pub use config::{CollaborationMode, HubConfig, StartOptions};
pub use error::{AgentError, ErrorCode, Result};
pub use event::{
    AssistantEvent, ErrorEvent, ImageAttachment, ImageRef, PermissionRequestEvent,
    ProviderEvent, ResultEvent, SessionEvent, Severity, SystemEvent, ToolResultEvent,
    ToolUseSummaryEvent, UserInputEvent,
};
pub use session::{BackendKind, SessionStatus, TokenUsage};
