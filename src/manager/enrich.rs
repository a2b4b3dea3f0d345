//! Best-effort enrichment of session events before they are forwarded
//!
//! Failures here are logged and never block delivery of the base event.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::types::{ProviderEvent, SystemEvent, ToolResultEvent};

use super::collaborators::ImageStore;

/// Absolute image paths mentioned in tool output
static IMAGE_PATH_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)(/[^\s"'`<>|]+\.(?:png|jpe?g|gif|webp))"#)
        .expect("image path regex is valid")
});

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp"];

fn is_image_path(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}

/// Plain text of a tool result's content
fn content_text(content: &Value) -> String {
    match content {
        Value::String(text) => text.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter_map(|block| match block {
                Value::String(text) => Some(text.as_str()),
                _ => block.get("text").and_then(Value::as_str),
            })
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

/// Slash commands and skills announced by `system(init)`, per project
#[derive(Debug, Default)]
pub struct SlashCommandCache {
    by_project: DashMap<PathBuf, (Option<Vec<String>>, Option<Vec<String>>)>,
}

impl SlashCommandCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember announced commands, or fill them in from an earlier session
    pub fn apply(&self, project: &Path, system: &mut SystemEvent) {
        if system.slash_commands.is_some() || system.skills.is_some() {
            self.by_project.insert(
                project.to_path_buf(),
                (system.slash_commands.clone(), system.skills.clone()),
            );
            return;
        }
        if let Some(cached) = self.by_project.get(project) {
            let (commands, skills) = cached.value();
            system.slash_commands.clone_from(commands);
            system.skills.clone_from(skills);
        }
    }

    pub fn get(&self, project: &Path) -> Option<Vec<String>> {
        self.by_project.get(project).and_then(|c| c.0.clone())
    }
}

/// Per-session enrichment state
#[derive(Debug)]
pub struct Enricher {
    session_id: String,
    project: PathBuf,
    /// tool_use id → (tool name, input)
    tool_uses: HashMap<String, (String, Value)>,
    images: Option<Arc<dyn ImageStore>>,
    commands: Arc<SlashCommandCache>,
}

impl Enricher {
    pub fn new(
        session_id: impl Into<String>,
        project: impl Into<PathBuf>,
        images: Option<Arc<dyn ImageStore>>,
        commands: Arc<SlashCommandCache>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            project: project.into(),
            tool_uses: HashMap::new(),
            images,
            commands,
        }
    }

    pub async fn enrich(&mut self, event: ProviderEvent) -> ProviderEvent {
        match event {
            ProviderEvent::Assistant(assistant) => {
                self.remember_tool_uses(&assistant.message);
                ProviderEvent::Assistant(assistant)
            }
            ProviderEvent::ToolResult(mut result) => {
                self.enrich_tool_result(&mut result).await;
                ProviderEvent::ToolResult(result)
            }
            ProviderEvent::System(mut system) => {
                self.commands.apply(&self.project, &mut system);
                ProviderEvent::System(system)
            }
            other => other,
        }
    }

    fn remember_tool_uses(&mut self, message: &Value) {
        let blocks = message
            .get("content")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter(|block| block.get("type").and_then(Value::as_str) == Some("tool_use"));
        for block in blocks {
            let (Some(id), Some(name)) = (
                block.get("id").and_then(Value::as_str),
                block.get("name").and_then(Value::as_str),
            ) else {
                continue;
            };
            let input = block.get("input").cloned().unwrap_or(Value::Null);
            self.tool_uses
                .insert(id.to_string(), (name.to_string(), input));
        }
    }

    async fn enrich_tool_result(&mut self, result: &mut ToolResultEvent) {
        let cached = self.tool_uses.get(&result.tool_use_id).cloned();
        if result.tool_name.is_none() {
            result.tool_name = cached.as_ref().map(|(name, _)| name.clone());
        }

        let raw_blocks = result.raw_blocks.take().unwrap_or_default();
        let Some(store) = self.images.clone() else {
            return;
        };

        let mut refs = Vec::new();
        for block in &raw_blocks {
            if block.get("type").and_then(Value::as_str) != Some("image") {
                continue;
            }
            let source = &block["source"];
            let (Some(media_type), Some(data)) = (
                source.get("media_type").and_then(Value::as_str),
                source.get("data").and_then(Value::as_str),
            ) else {
                continue;
            };
            match store.register_inline(&self.session_id, media_type, data).await {
                Ok(image) => refs.push(image),
                Err(e) => {
                    tracing::warn!(session_id = %self.session_id, tool_use_id = %result.tool_use_id, error = %e, "Failed to register inline image");
                }
            }
        }

        for path in Self::referenced_image_paths(cached.as_ref().map(|(_, input)| input), result) {
            match store.register_file(&self.session_id, &path).await {
                Ok(image) => refs.push(image),
                Err(e) => {
                    tracing::debug!(session_id = %self.session_id, path = %path.display(), error = %e, "Skipping image path");
                }
            }
        }

        if !refs.is_empty() {
            tracing::debug!(session_id = %self.session_id, tool_use_id = %result.tool_use_id, count = refs.len(), "Attached images to tool result");
            result.images.get_or_insert_with(Vec::new).extend(refs);
        }
    }

    /// Image files named by the tool input or mentioned in the output
    fn referenced_image_paths(input: Option<&Value>, result: &ToolResultEvent) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = Vec::new();
        let mut push = |path: PathBuf| {
            if is_image_path(&path) && !paths.contains(&path) {
                paths.push(path);
            }
        };

        if let Some(file_path) = input
            .and_then(|input| input.get("file_path"))
            .and_then(Value::as_str)
        {
            push(PathBuf::from(file_path));
        }
        if !result.is_error {
            let text = content_text(&result.content);
            for capture in IMAGE_PATH_RE.captures_iter(&text) {
                push(PathBuf::from(&capture[1]));
            }
        }
        paths
    }
}
