//! Read access to the delegate backend's on-disk transcripts
//!
//! Transcripts live at `<projects_dir>/<project-slug>/<session-id>.jsonl`,
//! one JSON record per line. The only write performed here is appending a
//! title record to the sibling `sessions-index.jsonl`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::io::AsyncWriteExt;

use crate::types::Result;

use super::history::UuidQueue;

/// Index file kept next to the transcripts of a project
const INDEX_FILE: &str = "sessions-index.jsonl";

/// Who wrote a past message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
}

/// One user or assistant message from an earlier conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PastMessage {
    pub role: MessageRole,
    pub uuid: String,
    pub text: String,
}

/// Assistant message UUID following a user message in a past conversation
pub fn find_assistant_uuid_after_user(messages: &[PastMessage], user_uuid: &str) -> Option<String> {
    let start = messages
        .iter()
        .position(|m| m.role == MessageRole::User && m.uuid == user_uuid)?;
    messages
        .iter()
        .skip(start + 1)
        .take_while(|m| m.role != MessageRole::User)
        .find(|m| m.role == MessageRole::Assistant)
        .map(|m| m.uuid.clone())
}

/// Directory name the backend uses for a project path
pub fn project_slug(path: &Path) -> String {
    path.to_string_lossy()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect()
}

/// Text of a message's content, or None for tool-result carriers
fn content_text(content: &Value) -> Option<String> {
    match content {
        Value::String(text) => Some(text.clone()),
        Value::Array(blocks) => {
            if blocks
                .iter()
                .any(|b| b.get("type").and_then(Value::as_str) == Some("tool_result"))
            {
                return None;
            }
            let text = blocks
                .iter()
                .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|b| b.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n");
            (!text.is_empty()).then_some(text)
        }
        _ => None,
    }
}

/// Parse one transcript line into a past message
fn parse_record(line: &str) -> Option<PastMessage> {
    let record: Value = serde_json::from_str(line).ok()?;
    let role = match record.get("type").and_then(Value::as_str)? {
        "user" => MessageRole::User,
        "assistant" => MessageRole::Assistant,
        _ => return None,
    };
    if record.get("isMeta").and_then(Value::as_bool) == Some(true) {
        return None;
    }
    let uuid = record.get("uuid").and_then(Value::as_str)?.to_string();
    let text = record
        .pointer("/message/content")
        .and_then(content_text)
        .unwrap_or_default();
    if role == MessageRole::User && text.is_empty() {
        return None;
    }
    Some(PastMessage { role, uuid, text })
}

/// Locates and reads backend transcripts
#[derive(Debug, Clone)]
pub struct TranscriptStore {
    projects_dir: PathBuf,
}

impl TranscriptStore {
    pub fn new(projects_dir: impl Into<PathBuf>) -> Self {
        Self {
            projects_dir: projects_dir.into(),
        }
    }

    pub fn projects_dir(&self) -> &Path {
        &self.projects_dir
    }

    /// Find the transcript of a backend session
    ///
    /// Tries the main project's directory, then the worktree's, then scans
    /// every project directory.
    pub async fn locate(
        &self,
        session_id: &str,
        project: &Path,
        worktree: Option<&Path>,
    ) -> Option<PathBuf> {
        let file_name = format!("{session_id}.jsonl");

        let candidates = std::iter::once(project).chain(worktree);
        for dir in candidates {
            let path = self.projects_dir.join(project_slug(dir)).join(&file_name);
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                return Some(path);
            }
        }

        let mut dirs = match tokio::fs::read_dir(&self.projects_dir).await {
            Ok(dirs) => dirs,
            Err(e) => {
                tracing::debug!(dir = %self.projects_dir.display(), error = %e, "Cannot scan projects");
                return None;
            }
        };
        while let Ok(Some(entry)) = dirs.next_entry().await {
            let path = entry.path().join(&file_name);
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                tracing::debug!(path = %path.display(), "Found transcript by scanning");
                return Some(path);
            }
        }
        None
    }

    /// Read every user/assistant message of a transcript
    ///
    /// Unparseable lines are skipped.
    pub async fn read_messages(&self, path: &Path) -> Result<Vec<PastMessage>> {
        let content = tokio::fs::read_to_string(path).await?;
        Ok(content.lines().filter_map(parse_record).collect())
    }

    /// FIFO text → UUID queues of the transcript's user messages
    pub async fn user_uuid_queue(&self, path: &Path) -> Result<UuidQueue> {
        let mut queue = UuidQueue::new();
        for message in self.read_messages(path).await? {
            if message.role == MessageRole::User {
                queue.push(message.text, message.uuid);
            }
        }
        Ok(queue)
    }

    /// Messages of an earlier conversation, empty when it cannot be found
    pub async fn load_messages(
        &self,
        session_id: &str,
        project: &Path,
        worktree: Option<&Path>,
    ) -> Result<Vec<PastMessage>> {
        match self.locate(session_id, project, worktree).await {
            Some(path) => self.read_messages(&path).await,
            None => Ok(Vec::new()),
        }
    }

    /// Append a caller-chosen title for a session to the sibling index
    pub async fn append_title(&self, transcript: &Path, session_id: &str, title: &str) -> Result<PathBuf> {
        let index = transcript
            .parent()
            .unwrap_or(&self.projects_dir)
            .join(INDEX_FILE);
        let mut line = json!({
            "type": "custom-title",
            "sessionId": session_id,
            "customTitle": title,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        })
        .to_string();
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&index)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(index)
    }
}
