//! Per-turn tool activity counters
//!
//! Filled by the post-tool-use hook, attached to the next result, then reset.

use std::sync::atomic::{AtomicU32, Ordering};

/// Tools whose invocation counts as a file edit
const FILE_EDIT_TOOLS: &[&str] = &["Edit", "MultiEdit", "Write", "NotebookEdit"];

/// Tool-call and file-edit counts since the last result
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TurnActivity {
    pub tool_calls: u32,
    pub file_edits: u32,
}

/// Tracks tool activity within a turn
///
/// Thread-safe counting using atomic operations.
#[derive(Debug, Default)]
pub struct TurnCounters {
    tool_calls: AtomicU32,
    file_edits: AtomicU32,
}

impl TurnCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one completed tool invocation
    pub fn record_tool(&self, tool_name: &str) {
        self.tool_calls.fetch_add(1, Ordering::Relaxed);
        if is_file_edit_tool(tool_name) {
            self.file_edits.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Current counts without resetting
    pub fn get(&self) -> TurnActivity {
        TurnActivity {
            tool_calls: self.tool_calls.load(Ordering::Relaxed),
            file_edits: self.file_edits.load(Ordering::Relaxed),
        }
    }

    /// Return the counts and reset them to zero
    pub fn take(&self) -> TurnActivity {
        TurnActivity {
            tool_calls: self.tool_calls.swap(0, Ordering::Relaxed),
            file_edits: self.file_edits.swap(0, Ordering::Relaxed),
        }
    }
}

fn is_file_edit_tool(tool_name: &str) -> bool {
    // MCP-wrapped tools carry a `mcp__<server>__` prefix
    let name = tool_name.rsplit("__").next().unwrap_or(tool_name);
    FILE_EDIT_TOOLS.contains(&name)
}
