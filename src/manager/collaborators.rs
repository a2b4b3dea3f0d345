//! External collaborators of the session manager
//!
//! Image persistence, git worktrees and the worktree mapping store live
//! outside this crate; the manager only talks to them through these traits.
//! [`GitWorktrees`] and [`MemoryWorktreeMappings`] are the stock
//! implementations.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::types::{AgentError, ImageRef, Result};

/// Persists images found in tool results
#[async_trait]
pub trait ImageStore: Send + Sync + std::fmt::Debug {
    /// Register an image file the agent referenced
    async fn register_file(&self, session_id: &str, path: &Path) -> Result<ImageRef>;

    /// Register an inline base64 image block
    async fn register_inline(
        &self,
        session_id: &str,
        media_type: &str,
        data: &str,
    ) -> Result<ImageRef>;
}

/// How a new session wants its working directory
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorktreeOptions {
    /// Create an isolated worktree instead of using the project directly
    pub create: bool,
    /// Branch for a new worktree; generated when absent
    pub branch: Option<String>,
    /// Reuse this existing worktree path
    pub existing_path: Option<PathBuf>,
}

/// A worktree a session runs in
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorktreeInfo {
    pub path: PathBuf,
    pub branch: Option<String>,
}

/// Backend session id → where that conversation's files live
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorktreeMapping {
    pub worktree_path: PathBuf,
    pub branch: Option<String>,
    pub project_path: PathBuf,
}

/// Creates worktrees and inspects branches
#[async_trait]
pub trait WorktreeProvider: Send + Sync + std::fmt::Debug {
    async fn create(&self, project: &Path, options: &WorktreeOptions) -> Result<WorktreeInfo>;

    /// Current branch of a checkout, if it is one
    async fn current_branch(&self, path: &Path) -> Option<String>;
}

/// Remembers which worktree a backend conversation belongs to
pub trait WorktreeMappingStore: Send + Sync + std::fmt::Debug {
    fn get(&self, backend_session_id: &str) -> Option<WorktreeMapping>;
    fn put(&self, backend_session_id: &str, mapping: WorktreeMapping);
}

/// Process-local mapping store
#[derive(Debug, Default)]
pub struct MemoryWorktreeMappings {
    mappings: DashMap<String, WorktreeMapping>,
}

impl MemoryWorktreeMappings {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WorktreeMappingStore for MemoryWorktreeMappings {
    fn get(&self, backend_session_id: &str) -> Option<WorktreeMapping> {
        self.mappings.get(backend_session_id).map(|r| r.clone())
    }

    fn put(&self, backend_session_id: &str, mapping: WorktreeMapping) {
        self.mappings.insert(backend_session_id.to_string(), mapping);
    }
}

/// Worktrees via the `git` CLI
///
/// New worktrees go to `<project>/.worktrees/<branch>`.
#[derive(Debug, Clone)]
pub struct GitWorktrees {
    git: String,
}

impl Default for GitWorktrees {
    fn default() -> Self {
        Self {
            git: "git".to_string(),
        }
    }
}

impl GitWorktrees {
    pub fn new() -> Self {
        Self::default()
    }

    async fn git(&self, cwd: &Path, args: &[&str]) -> Result<String> {
        let output = Command::new(&self.git)
            .args(args)
            .current_dir(cwd)
            .output()
            .await
            .map_err(|e| AgentError::spawn_failed(&self.git, e))?;
        if !output.status.success() {
            return Err(AgentError::internal(format!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl WorktreeProvider for GitWorktrees {
    async fn create(&self, project: &Path, options: &WorktreeOptions) -> Result<WorktreeInfo> {
        let branch = options.branch.clone().unwrap_or_else(|| {
            format!("agent/{}", &uuid::Uuid::new_v4().simple().to_string()[..8])
        });
        let path = project
            .join(".worktrees")
            .join(branch.replace('/', "-"));
        let path_arg = path.to_string_lossy().into_owned();

        self.git(project, &["worktree", "add", "-b", &branch, &path_arg])
            .await?;
        tracing::info!(path = %path.display(), branch = %branch, "Created worktree");
        Ok(WorktreeInfo {
            path,
            branch: Some(branch),
        })
    }

    async fn current_branch(&self, path: &Path) -> Option<String> {
        match self.git(path, &["rev-parse", "--abbrev-ref", "HEAD"]).await {
            Ok(branch) if !branch.is_empty() && branch != "HEAD" => Some(branch),
            Ok(_) => None,
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "No git branch");
                None
            }
        }
    }
}
