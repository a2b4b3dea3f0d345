//! Session-scoped settings
//!
//! Allow-rules granted by the caller during a session. They bypass the
//! approval gate for matching tool calls and are never persisted.

mod rule;

pub use rule::{
    ParsedRule, SessionRules, build_session_rule, first_matching_rule, matches_session_rule,
};
