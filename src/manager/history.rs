//! Bounded per-session event history
//!
//! Streaming deltas never enter the history. When the cap is exceeded the
//! oldest non-`user_input` entry goes first, so caller prompts survive longest
//! for rewind lookups.

use std::collections::{HashMap, VecDeque};

use crate::types::{ProviderEvent, UserInputEvent};

/// FIFO queues of message UUIDs keyed by message text
///
/// Identical texts are consumed in transcript order, so two "yes" prompts
/// never receive the same UUID.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UuidQueue {
    by_text: HashMap<String, VecDeque<String>>,
}

impl UuidQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, text: impl Into<String>, uuid: impl Into<String>) {
        self.by_text
            .entry(text.into())
            .or_default()
            .push_back(uuid.into());
    }

    /// Take the oldest UUID recorded for `text`
    pub fn pop(&mut self, text: &str) -> Option<String> {
        let queue = self.by_text.get_mut(text)?;
        let uuid = queue.pop_front();
        if queue.is_empty() {
            self.by_text.remove(text);
        }
        uuid
    }

    /// Drop a UUID that is already assigned in memory
    pub fn discard(&mut self, text: &str, uuid: &str) {
        if let Some(queue) = self.by_text.get_mut(text) {
            queue.retain(|queued| queued != uuid);
            if queue.is_empty() {
                self.by_text.remove(text);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.by_text.is_empty()
    }
}

/// What happened to a pushed event
#[derive(Debug, Clone, PartialEq)]
pub enum PushOutcome {
    /// Stored as a new entry
    Appended,
    /// Merged into an earlier placeholder; carries the updated entry
    Merged(ProviderEvent),
    /// Not kept (streaming delta)
    Skipped,
}

/// Ordered, capped history of one session
#[derive(Debug, Clone)]
pub struct SessionHistory {
    entries: VecDeque<ProviderEvent>,
    limit: usize,
}

impl SessionHistory {
    pub fn new(limit: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            limit: limit.max(1),
        }
    }

    pub fn push(&mut self, event: ProviderEvent) -> PushOutcome {
        if event.is_streaming_delta() {
            return PushOutcome::Skipped;
        }

        if let ProviderEvent::UserInput(ref echo) = event {
            if let Some(uuid) = echo.user_message_uuid.as_deref() {
                if let Some(merged) = self.merge_user_uuid(&echo.text, uuid) {
                    return PushOutcome::Merged(merged);
                }
            }
        }

        self.entries.push_back(event);
        self.evict();
        PushOutcome::Appended
    }

    /// Give the newest UUID-less placeholder this UUID
    ///
    /// Prefers a placeholder with the same text, otherwise the newest one.
    fn merge_user_uuid(&mut self, text: &str, uuid: &str) -> Option<ProviderEvent> {
        let placeholders = || {
            self.entries
                .iter()
                .enumerate()
                .rev()
                .filter_map(|(index, entry)| match entry {
                    ProviderEvent::UserInput(input) if input.user_message_uuid.is_none() => {
                        Some((index, input.text.as_str()))
                    }
                    _ => None,
                })
        };
        let index = placeholders()
            .find(|(_, placeholder)| *placeholder == text)
            .or_else(|| placeholders().next())
            .map(|(index, _)| index)?;

        let entry = self.entries.get_mut(index)?;
        if let ProviderEvent::UserInput(input) = entry {
            input.user_message_uuid = Some(uuid.to_string());
        }
        Some(entry.clone())
    }

    fn evict(&mut self) {
        while self.entries.len() > self.limit {
            let victim = self
                .entries
                .iter()
                .position(|entry| !matches!(entry, ProviderEvent::UserInput(_)))
                .unwrap_or(0);
            self.entries.remove(victim);
        }
    }

    /// Assign disk UUIDs to user entries still lacking one
    ///
    /// Returns the updated entries in history order.
    pub fn backfill_user_uuids(&mut self, queue: &mut UuidQueue) -> Vec<ProviderEvent> {
        for entry in &self.entries {
            if let ProviderEvent::UserInput(UserInputEvent {
                text,
                user_message_uuid: Some(uuid),
                ..
            }) = entry
            {
                queue.discard(text, uuid);
            }
        }

        let mut updated = Vec::new();
        for entry in &mut self.entries {
            if let ProviderEvent::UserInput(input) = entry {
                if input.user_message_uuid.is_none() {
                    if let Some(uuid) = queue.pop(&input.text) {
                        input.user_message_uuid = Some(uuid);
                        updated.push(entry.clone());
                    }
                }
            }
        }
        updated
    }

    /// UUID of the first assistant message answering the given user message
    pub fn find_assistant_uuid_after_user(&self, user_uuid: &str) -> Option<String> {
        let start = self.entries.iter().position(|entry| {
            matches!(entry, ProviderEvent::UserInput(input)
                if input.user_message_uuid.as_deref() == Some(user_uuid))
        })?;

        self.entries
            .iter()
            .skip(start + 1)
            .take_while(|entry| !matches!(entry, ProviderEvent::UserInput(_)))
            .find_map(|entry| match entry {
                ProviderEvent::Assistant(assistant) => assistant.uuid.clone(),
                _ => None,
            })
    }

    pub fn entries(&self) -> impl Iterator<Item = &ProviderEvent> {
        self.entries.iter()
    }

    pub fn to_vec(&self) -> Vec<ProviderEvent> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AssistantEvent, SessionStatus};
    use pretty_assertions::assert_eq;

    fn user(text: &str, uuid: Option<&str>) -> ProviderEvent {
        ProviderEvent::UserInput(UserInputEvent {
            text: text.to_string(),
            user_message_uuid: uuid.map(String::from),
            image_count: None,
        })
    }

    fn assistant(uuid: &str) -> ProviderEvent {
        ProviderEvent::Assistant(AssistantEvent {
            uuid: Some(uuid.to_string()),
            ..AssistantEvent::text("ok")
        })
    }

    fn user_uuids(history: &SessionHistory) -> Vec<Option<String>> {
        history
            .entries()
            .filter_map(|entry| match entry {
                ProviderEvent::UserInput(input) => Some(input.user_message_uuid.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_streaming_deltas_skipped() {
        let mut history = SessionHistory::new(10);
        assert_eq!(
            history.push(ProviderEvent::StreamDelta {
                text: "x".to_string()
            }),
            PushOutcome::Skipped
        );
        assert_eq!(
            history.push(ProviderEvent::ThinkingDelta {
                text: "y".to_string()
            }),
            PushOutcome::Skipped
        );
        assert!(history.is_empty());
    }

    #[test]
    fn test_eviction_prefers_non_user_entries() {
        let mut history = SessionHistory::new(3);
        history.push(user("first", None));
        history.push(ProviderEvent::status(SessionStatus::Running));
        history.push(user("second", None));
        history.push(assistant("a-1"));

        assert_eq!(history.len(), 3);
        assert!(
            history
                .entries()
                .all(|e| !matches!(e, ProviderEvent::Status { .. }))
        );

        // Only user entries left: the oldest one goes
        let mut history = SessionHistory::new(2);
        history.push(user("a", None));
        history.push(user("b", None));
        history.push(user("c", None));
        let texts: Vec<_> = history
            .entries()
            .filter_map(|e| match e {
                ProviderEvent::UserInput(u) => Some(u.text.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(texts, vec!["b".to_string(), "c".to_string()]);
    }

    #[test]
    fn test_echo_merges_into_newest_placeholder() {
        let mut history = SessionHistory::new(10);
        history.push(user("hello", None));
        history.push(user("hello", None));

        let outcome = history.push(user("hello", Some("u-9")));
        assert_eq!(outcome, PushOutcome::Merged(user("hello", Some("u-9"))));
        assert_eq!(history.len(), 2);
        assert_eq!(user_uuids(&history), vec![None, Some("u-9".to_string())]);
    }

    #[test]
    fn test_echo_without_placeholder_appends() {
        let mut history = SessionHistory::new(10);
        assert_eq!(
            history.push(user("hi", Some("u-1"))),
            PushOutcome::Appended
        );
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn test_backfill_duplicate_texts_fifo() {
        let mut history = SessionHistory::new(10);
        history.push(user("yes", None));
        history.push(assistant("a-1"));
        history.push(user("yes", None));

        let mut queue = UuidQueue::new();
        queue.push("yes", "u-1");
        queue.push("yes", "u-2");

        let updated = history.backfill_user_uuids(&mut queue);
        assert_eq!(updated.len(), 2);
        assert_eq!(
            user_uuids(&history),
            vec![Some("u-1".to_string()), Some("u-2".to_string())]
        );
        assert!(queue.is_empty());
    }

    #[test]
    fn test_backfill_skips_already_assigned_uuids() {
        let mut history = SessionHistory::new(10);
        history.push(user("yes", Some("u-1")));
        history.push(user("yes", None));

        let mut queue = UuidQueue::new();
        queue.push("yes", "u-1");
        queue.push("yes", "u-2");

        history.backfill_user_uuids(&mut queue);
        assert_eq!(
            user_uuids(&history),
            vec![Some("u-1".to_string()), Some("u-2".to_string())]
        );
    }

    #[test]
    fn test_find_assistant_after_user() {
        let mut history = SessionHistory::new(10);
        history.push(user("one", Some("u1")));
        history.push(assistant("a1"));
        history.push(user("two", Some("u2")));

        assert_eq!(
            history.find_assistant_uuid_after_user("u1").as_deref(),
            Some("a1")
        );
        assert_eq!(history.find_assistant_uuid_after_user("u2"), None);
        assert_eq!(history.find_assistant_uuid_after_user("missing"), None);
    }
}
