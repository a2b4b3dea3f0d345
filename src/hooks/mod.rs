//! Hooks for the delegate backend's tool lifecycle
//!
//! Only PostToolUse is used: it feeds the per-turn activity counters.

mod post_tool_use;

pub use post_tool_use::create_post_tool_use_hook;
