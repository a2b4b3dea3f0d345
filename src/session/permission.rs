//! Permission gating for delegate-variant tool calls
//!
//! The gate runs before every gated tool call: question tools always reach
//! the caller, the permission mode may pre-approve, then session allow-rules,
//! and anything left is forwarded as a `permission_request`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::settings::SessionRules;

/// Tools that collect caller input and are never auto-approved
const FORWARDED_TOOLS: &[&str] = &["AskUserQuestion", "ExitPlanMode"];

/// Tools pre-approved under `acceptEdits`
const EDIT_TOOLS: &[&str] = &["Edit", "MultiEdit", "Write", "NotebookEdit"];

/// Permission mode for tool execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PermissionMode {
    /// Every gated call not covered by a rule is forwarded
    #[default]
    Default,
    /// Auto-approve file edits
    AcceptEdits,
    /// Planning mode; the backend itself keeps tools read-only
    Plan,
    /// Approve everything except caller-input tools
    BypassPermissions,
}

impl PermissionMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "default" => Some(Self::Default),
            "acceptEdits" => Some(Self::AcceptEdits),
            "plan" => Some(Self::Plan),
            "bypassPermissions" => Some(Self::BypassPermissions),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::AcceptEdits => "acceptEdits",
            Self::Plan => "plan",
            Self::BypassPermissions => "bypassPermissions",
        }
    }

    /// Whether this mode approves the tool without asking
    pub fn auto_approves(&self, tool_name: &str) -> bool {
        match self {
            Self::BypassPermissions => true,
            Self::AcceptEdits => EDIT_TOOLS.contains(&tool_name),
            Self::Default | Self::Plan => false,
        }
    }
}

/// Outcome of the gate's local checks
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateCheck {
    /// Approved by the permission mode
    AllowedByMode,
    /// Approved by a session allow-rule
    AllowedByRule(String),
    /// The caller has to decide
    Forward,
}

/// Whether the tool always goes to the caller
pub fn is_forwarded_tool(tool_name: &str) -> bool {
    FORWARDED_TOOLS.contains(&tool_name)
}

/// Run the local checks for one gated call
pub fn check_tool(
    mode: PermissionMode,
    rules: &SessionRules,
    tool_name: &str,
    input: &Value,
) -> GateCheck {
    if is_forwarded_tool(tool_name) {
        return GateCheck::Forward;
    }
    if mode.auto_approves(tool_name) {
        return GateCheck::AllowedByMode;
    }
    match rules.find_match(tool_name, input) {
        Some(rule) => GateCheck::AllowedByRule(rule.to_string()),
        None => GateCheck::Forward,
    }
}
