//! Session management
//!
//! [`SessionManager`] owns every provider session. It enriches, buffers and
//! forwards their events, backfills message UUIDs from the backend's own
//! transcripts, and implements rewind on top of resume.

mod collaborators;
mod enrich;
mod factory;
mod history;
mod session_manager;
mod transcript;

pub use collaborators::{
    GitWorktrees, ImageStore, MemoryWorktreeMappings, WorktreeInfo, WorktreeMapping,
    WorktreeMappingStore, WorktreeOptions, WorktreeProvider,
};
pub use enrich::{Enricher, SlashCommandCache};
pub use factory::{BackendFactory, SessionFactory};
pub use history::{PushOutcome, SessionHistory, UuidQueue};
pub use session_manager::{
    CreateRequest, HubEvent, ManagerOutcome, SessionManager, SessionManagerBuilder,
    SessionSummary,
};
pub use transcript::{
    MessageRole, PastMessage, TranscriptStore, find_assistant_uuid_after_user, project_slug,
};
