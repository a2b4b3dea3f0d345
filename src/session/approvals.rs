//! Pending approval tables
//!
//! Every gated tool call is recorded under a tool-use id until the caller
//! decides. Each entry resolves exactly once: taking it out of the table is
//! the resolution, so a second decision for the same id finds nothing.

use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Caller decision on a gated tool call
#[derive(Debug, Clone, PartialEq)]
pub enum ApprovalDecision {
    /// Allow once, optionally with rewritten input
    Approve { updated_input: Option<Value> },
    /// Allow and record a session allow-rule for similar calls
    ApproveAlways,
    /// Deny, optionally telling the agent why
    Reject { message: Option<String> },
    /// Answers for a user-question request
    Answer(Value),
    /// The request's abort signal fired before a decision arrived
    TimedOut,
}

impl ApprovalDecision {
    pub fn is_allow(&self) -> bool {
        matches!(
            self,
            Self::Approve { .. } | Self::ApproveAlways | Self::Answer(_)
        )
    }
}

/// Caller-visible view of a pending approval
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingPermission {
    pub tool_use_id: String,
    pub tool_name: String,
    pub input: Value,
}

/// Anything stored in a [`PendingTable`] that can be shown to the caller
pub trait PendingEntry {
    fn tool_name(&self) -> &str;
    fn input(&self) -> &Value;
}

/// Insertion-ordered table of unresolved approvals
#[derive(Debug)]
pub struct PendingTable<T> {
    entries: Mutex<Vec<(String, T)>>,
}

impl<T> Default for PendingTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PendingTable<T> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<(String, T)>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a pending entry; an existing entry with the same id is replaced
    pub fn insert(&self, tool_use_id: impl Into<String>, entry: T) {
        let tool_use_id = tool_use_id.into();
        let mut entries = self.lock();
        entries.retain(|(id, _)| *id != tool_use_id);
        entries.push((tool_use_id, entry));
    }

    /// Remove and return an entry
    ///
    /// With no id, the oldest pending entry is taken.
    pub fn take(&self, tool_use_id: Option<&str>) -> Option<(String, T)> {
        let mut entries = self.lock();
        let index = match tool_use_id {
            Some(wanted) => entries.iter().position(|(id, _)| id == wanted)?,
            None if entries.is_empty() => return None,
            None => 0,
        };
        Some(entries.remove(index))
    }

    pub fn contains(&self, tool_use_id: &str) -> bool {
        self.lock().iter().any(|(id, _)| id == tool_use_id)
    }

    /// Drop every entry without resolving it
    pub fn clear(&self) -> usize {
        let mut entries = self.lock();
        let count = entries.len();
        entries.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl<T: PendingEntry> PendingTable<T> {
    /// Look up a pending entry without resolving it
    ///
    /// With no id, the oldest pending entry is returned.
    pub fn view(&self, tool_use_id: Option<&str>) -> Option<PendingPermission> {
        let entries = self.lock();
        let (id, entry) = match tool_use_id {
            Some(wanted) => entries.iter().find(|(id, _)| id == wanted)?,
            None => entries.first()?,
        };
        Some(PendingPermission {
            tool_use_id: id.clone(),
            tool_name: entry.tool_name().to_string(),
            input: entry.input().clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug)]
    struct Entry {
        tool_name: String,
        input: Value,
    }

    impl PendingEntry for Entry {
        fn tool_name(&self) -> &str {
            &self.tool_name
        }

        fn input(&self) -> &Value {
            &self.input
        }
    }

    fn entry(tool_name: &str) -> Entry {
        Entry {
            tool_name: tool_name.to_string(),
            input: json!({"command": "ls"}),
        }
    }

    #[test]
    fn test_single_resolution() {
        let table = PendingTable::new();
        table.insert("tu-1", entry("Bash"));

        assert!(table.take(Some("tu-1")).is_some());
        // A second decision on the same id is a no-op
        assert!(table.take(Some("tu-1")).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn test_take_without_id_takes_oldest() {
        let table = PendingTable::new();
        table.insert("tu-1", entry("Bash"));
        table.insert("tu-2", entry("Edit"));

        let (id, taken) = table.take(None).unwrap();
        assert_eq!(id, "tu-1");
        assert_eq!(taken.tool_name, "Bash");
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_view_does_not_resolve() {
        let table = PendingTable::new();
        table.insert("tu-1", entry("Bash"));

        let view = table.view(None).unwrap();
        assert_eq!(view.tool_use_id, "tu-1");
        assert_eq!(view.tool_name, "Bash");
        assert_eq!(view.input, json!({"command": "ls"}));
        assert!(table.contains("tu-1"));
        assert!(table.view(Some("missing")).is_none());
    }

    #[test]
    fn test_clear_abandons_entries() {
        let table = PendingTable::new();
        table.insert("tu-1", entry("Bash"));
        table.insert("tu-2", entry("Edit"));
        assert_eq!(table.clear(), 2);
        assert!(table.take(None).is_none());
    }

    #[test]
    fn test_decision_is_allow() {
        assert!(ApprovalDecision::ApproveAlways.is_allow());
        assert!(ApprovalDecision::Answer(json!({})).is_allow());
        assert!(!ApprovalDecision::Reject { message: None }.is_allow());
        assert!(!ApprovalDecision::TimedOut.is_allow());
    }
}
