//! The session registry
//!
//! Every session's outbound queue is drained by one task that enriches,
//! buffers and forwards events strictly in emission order, however long a
//! single event takes to process.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::delegate::ClaudeQuery;
use crate::session::{
    EventEmitter, EventReceiver, PendingPermission, ProviderSession, event_channel, lock,
};
use crate::tracing::ErrorTraceExt;
use crate::types::{
    AgentError, BackendKind, HubConfig, ImageAttachment, ProviderEvent, Result, SessionEvent,
    SessionStatus, StartOptions,
};

use super::collaborators::{
    ImageStore, MemoryWorktreeMappings, WorktreeInfo, WorktreeMapping, WorktreeMappingStore,
    WorktreeOptions, WorktreeProvider,
};
use super::enrich::{Enricher, SlashCommandCache};
use super::factory::{BackendFactory, SessionFactory};
use super::history::{PushOutcome, SessionHistory};
use super::transcript::{PastMessage, TranscriptStore, find_assistant_uuid_after_user};

/// What the manager forwards to its owner
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HubEvent {
    #[serde(rename_all = "camelCase")]
    Message {
        session_id: String,
        event: ProviderEvent,
    },
    #[serde(rename_all = "camelCase")]
    Exited {
        session_id: String,
        code: Option<i32>,
    },
}

/// Typed result of an operation addressed to a session id
#[derive(Debug, Clone, PartialEq)]
pub enum ManagerOutcome<T> {
    Ok(T),
    NotFound(String),
    Unsupported {
        backend: BackendKind,
        operation: &'static str,
    },
}

impl<T> ManagerOutcome<T> {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok(_))
    }

    pub fn ok(self) -> Option<T> {
        match self {
            Self::Ok(value) => Some(value),
            _ => None,
        }
    }

    /// Fold into the crate error type
    pub fn into_result(self) -> Result<T> {
        match self {
            Self::Ok(value) => Ok(value),
            Self::NotFound(id) => Err(AgentError::session_not_found(id)),
            Self::Unsupported { backend, operation } => Err(AgentError::Unsupported {
                backend: backend.as_str(),
                operation,
            }),
        }
    }
}

/// Parameters of [`SessionManager::create`]
#[derive(Debug, Clone)]
pub struct CreateRequest {
    pub project_path: PathBuf,
    pub backend: BackendKind,
    pub options: StartOptions,
    /// Messages of the conversation being resumed, for rewind lookups
    pub past_messages: Option<Vec<PastMessage>>,
    pub worktree: Option<WorktreeOptions>,
}

impl CreateRequest {
    pub fn new(project_path: impl Into<PathBuf>, backend: BackendKind) -> Self {
        Self {
            project_path: project_path.into(),
            backend,
            options: StartOptions::default(),
            past_messages: None,
            worktree: None,
        }
    }

    pub fn with_options(mut self, options: StartOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_past_messages(mut self, messages: Vec<PastMessage>) -> Self {
        self.past_messages = Some(messages);
        self
    }

    pub fn with_worktree(mut self, worktree: WorktreeOptions) -> Self {
        self.worktree = Some(worktree);
        self
    }
}

/// Caller-visible summary of a session
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: String,
    pub backend: BackendKind,
    pub status: SessionStatus,
    pub project_path: PathBuf,
    pub cwd: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worktree: Option<WorktreeInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend_session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub history_len: usize,
}

#[derive(Debug)]
struct RecordState {
    history: SessionHistory,
    past_messages: Vec<PastMessage>,
    name: Option<String>,
    mapped: bool,
}

#[derive(Debug)]
struct SessionRecord {
    id: String,
    backend: BackendKind,
    session: Arc<dyn ProviderSession>,
    project_path: PathBuf,
    cwd: PathBuf,
    worktree: Option<WorktreeInfo>,
    branch: Option<String>,
    options: StartOptions,
    state: Mutex<RecordState>,
    /// The session's own outbound queue; manager-side events join it in order
    queue: EventEmitter,
    /// Cancelled once the record leaves the registry
    closed: CancellationToken,
}

impl SessionRecord {
    fn summary(&self) -> SessionSummary {
        let state = lock(&self.state);
        SessionSummary {
            id: self.id.clone(),
            backend: self.backend,
            status: self.session.status(),
            project_path: self.project_path.clone(),
            cwd: self.cwd.clone(),
            worktree: self.worktree.clone(),
            branch: self.branch.clone(),
            backend_session_id: self.session.backend_session_id(),
            name: state.name.clone(),
            history_len: state.history.len(),
        }
    }

    fn backend_session_id(&self) -> Option<String> {
        self.session
            .backend_session_id()
            .or_else(|| self.options.resume.clone())
    }
}

/// Builder for [`SessionManager`]
#[derive(Debug, Default)]
pub struct SessionManagerBuilder {
    config: HubConfig,
    factory: Option<Arc<dyn SessionFactory>>,
    images: Option<Arc<dyn ImageStore>>,
    worktrees: Option<Arc<dyn WorktreeProvider>>,
    mappings: Option<Arc<dyn WorktreeMappingStore>>,
}

impl SessionManagerBuilder {
    pub fn config(mut self, config: HubConfig) -> Self {
        self.config = config;
        self
    }

    pub fn factory(mut self, factory: Arc<dyn SessionFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn image_store(mut self, images: Arc<dyn ImageStore>) -> Self {
        self.images = Some(images);
        self
    }

    pub fn worktrees(mut self, worktrees: Arc<dyn WorktreeProvider>) -> Self {
        self.worktrees = Some(worktrees);
        self
    }

    pub fn worktree_mappings(mut self, mappings: Arc<dyn WorktreeMappingStore>) -> Self {
        self.mappings = Some(mappings);
        self
    }

    /// Build the manager and the receiver of everything it forwards
    pub fn build(self) -> (SessionManager, mpsc::UnboundedReceiver<HubEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let factory = self.factory.unwrap_or_else(|| {
            Arc::new(BackendFactory::new(
                self.config.clone(),
                Arc::new(ClaudeQuery::new()),
            ))
        });
        let inner = ManagerInner {
            transcripts: TranscriptStore::new(self.config.claude_projects_dir.clone()),
            config: self.config,
            factory,
            sessions: DashMap::new(),
            images: self.images,
            worktrees: self.worktrees,
            mappings: self
                .mappings
                .unwrap_or_else(|| Arc::new(MemoryWorktreeMappings::new())),
            commands: Arc::new(SlashCommandCache::new()),
            events,
        };
        (
            SessionManager {
                inner: Arc::new(inner),
            },
            rx,
        )
    }
}

#[derive(Debug)]
struct ManagerInner {
    config: HubConfig,
    factory: Arc<dyn SessionFactory>,
    sessions: DashMap<String, Arc<SessionRecord>>,
    transcripts: TranscriptStore,
    images: Option<Arc<dyn ImageStore>>,
    worktrees: Option<Arc<dyn WorktreeProvider>>,
    mappings: Arc<dyn WorktreeMappingStore>,
    commands: Arc<SlashCommandCache>,
    events: mpsc::UnboundedSender<HubEvent>,
}

/// Owns every live session and forwards their events
#[derive(Debug, Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

impl SessionManager {
    pub fn builder() -> SessionManagerBuilder {
        SessionManagerBuilder::default()
    }

    fn record(&self, id: &str) -> Option<Arc<SessionRecord>> {
        self.inner.sessions.get(id).map(|r| Arc::clone(r.value()))
    }

    /// Create and start a session, returning its id
    pub async fn create(&self, request: CreateRequest) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        let span = tracing::info_span!("create_session", session_id = %id, backend = %request.backend);
        self.create_with_id(id.clone(), request)
            .instrument(span)
            .await?;
        Ok(id)
    }

    async fn create_with_id(&self, id: String, request: CreateRequest) -> Result<()> {
        let inner = &self.inner;
        let (cwd, worktree) = self.resolve_cwd(&request).await?;
        let branch = match &inner.worktrees {
            Some(worktrees) => worktrees.current_branch(&cwd).await,
            None => None,
        };

        let (queue, events) = event_channel();
        let session = inner.factory.build(&id, request.backend, queue.clone())?;

        let past_messages = match request.past_messages {
            Some(messages) => messages,
            None => self.load_past_messages(&request, worktree.as_ref()).await,
        };

        let record = Arc::new(SessionRecord {
            id: id.clone(),
            backend: request.backend,
            session: session.clone(),
            project_path: request.project_path.clone(),
            cwd: cwd.clone(),
            worktree,
            branch,
            options: request.options.clone(),
            state: Mutex::new(RecordState {
                history: SessionHistory::new(inner.config.history_limit),
                past_messages,
                name: None,
                mapped: false,
            }),
            queue,
            closed: CancellationToken::new(),
        });
        inner.sessions.insert(id.clone(), record.clone());
        self.spawn_drain(record.clone(), events);

        tracing::info!(cwd = %cwd.display(), "Starting session");
        if let Err(e) = session.start(cwd, request.options).await {
            e.trace_error();
            self.remove(&id, &record).await;
            return Err(e);
        }
        Ok(())
    }

    async fn resolve_cwd(&self, request: &CreateRequest) -> Result<(PathBuf, Option<WorktreeInfo>)> {
        let inner = &self.inner;
        if let Some(mapping) = request
            .options
            .resume
            .as_deref()
            .and_then(|resume| inner.mappings.get(resume))
        {
            tracing::debug!(path = %mapping.worktree_path.display(), "Reusing mapped worktree");
            return Ok((
                mapping.worktree_path.clone(),
                Some(WorktreeInfo {
                    path: mapping.worktree_path,
                    branch: mapping.branch,
                }),
            ));
        }

        let Some(options) = &request.worktree else {
            return Ok((request.project_path.clone(), None));
        };
        if let Some(path) = &options.existing_path {
            let branch = match &inner.worktrees {
                Some(worktrees) => worktrees.current_branch(path).await,
                None => options.branch.clone(),
            };
            return Ok((
                path.clone(),
                Some(WorktreeInfo {
                    path: path.clone(),
                    branch,
                }),
            ));
        }
        if !options.create {
            return Ok((request.project_path.clone(), None));
        }
        let worktrees = inner
            .worktrees
            .as_ref()
            .ok_or_else(|| AgentError::config_error("no worktree provider configured"))?;
        let info = worktrees.create(&request.project_path, options).await?;
        Ok((info.path.clone(), Some(info)))
    }

    async fn load_past_messages(
        &self,
        request: &CreateRequest,
        worktree: Option<&WorktreeInfo>,
    ) -> Vec<PastMessage> {
        let Some(resume) = request.options.resume.as_deref() else {
            return Vec::new();
        };
        if request.backend != BackendKind::Claude {
            return Vec::new();
        }
        self.inner
            .transcripts
            .load_messages(
                resume,
                &request.project_path,
                worktree.map(|w| w.path.as_path()),
            )
            .await
            .unwrap_or_else(|e| {
                tracing::warn!(resume = %resume, error = %e, "Failed to load past messages");
                Vec::new()
            })
    }

    fn spawn_drain(&self, record: Arc<SessionRecord>, mut events: EventReceiver) {
        let inner = self.inner.clone();
        let span = tracing::info_span!("session_events", session_id = %record.id);
        tokio::spawn(
            async move {
                let mut enricher = Enricher::new(
                    record.id.clone(),
                    record.project_path.clone(),
                    inner.images.clone(),
                    inner.commands.clone(),
                );
                loop {
                    let event = tokio::select! {
                        () = record.closed.cancelled() => break,
                        event = events.recv() => event,
                    };
                    match event {
                        Some(SessionEvent::Message(event)) => {
                            let event = enricher.enrich(event).await;
                            inner.handle_event(&record, event).await;
                        }
                        Some(SessionEvent::Exit { code }) => {
                            tracing::info!(code = ?code, "Session exited");
                            inner.send(
                                &record,
                                HubEvent::Exited {
                                    session_id: record.id.clone(),
                                    code,
                                },
                            );
                        }
                        None => break,
                    }
                }
                tracing::debug!("Event drain finished");
            }
            .instrument(span),
        );
    }

    async fn remove(&self, id: &str, record: &Arc<SessionRecord>) {
        self.inner
            .sessions
            .remove_if(id, |_, current| Arc::ptr_eq(current, record));
        record.session.stop().await;
        record.closed.cancel();
    }

    /// Queue caller input
    ///
    /// The placeholder `user_input` goes through the session's event queue, so
    /// it lands after everything the session emitted before and ahead of the
    /// backend's echo.
    pub fn send_input(
        &self,
        id: &str,
        text: impl Into<String>,
        images: Vec<ImageAttachment>,
    ) -> ManagerOutcome<()> {
        let Some(record) = self.record(id) else {
            return ManagerOutcome::NotFound(id.to_string());
        };
        let text = text.into();
        record
            .queue
            .emit(ProviderEvent::user_input(text.clone(), images.len()));
        record.session.send_input_with_images(text, images);
        ManagerOutcome::Ok(())
    }

    pub async fn approve(
        &self,
        id: &str,
        tool_use_id: Option<&str>,
        updated_input: Option<Value>,
    ) -> ManagerOutcome<bool> {
        match self.record(id) {
            Some(record) => {
                ManagerOutcome::Ok(record.session.approve(tool_use_id, updated_input).await)
            }
            None => ManagerOutcome::NotFound(id.to_string()),
        }
    }

    pub async fn approve_always(&self, id: &str, tool_use_id: Option<&str>) -> ManagerOutcome<bool> {
        match self.record(id) {
            Some(record) => ManagerOutcome::Ok(record.session.approve_always(tool_use_id).await),
            None => ManagerOutcome::NotFound(id.to_string()),
        }
    }

    pub async fn reject(
        &self,
        id: &str,
        tool_use_id: Option<&str>,
        message: Option<String>,
    ) -> ManagerOutcome<bool> {
        match self.record(id) {
            Some(record) => ManagerOutcome::Ok(record.session.reject(tool_use_id, message).await),
            None => ManagerOutcome::NotFound(id.to_string()),
        }
    }

    pub async fn answer(&self, id: &str, tool_use_id: &str, result: Value) -> ManagerOutcome<bool> {
        match self.record(id) {
            Some(record) => ManagerOutcome::Ok(record.session.answer(tool_use_id, result).await),
            None => ManagerOutcome::NotFound(id.to_string()),
        }
    }

    pub fn pending_permission(
        &self,
        id: &str,
        tool_use_id: Option<&str>,
    ) -> ManagerOutcome<Option<PendingPermission>> {
        match self.record(id) {
            Some(record) => ManagerOutcome::Ok(record.session.pending_permission(tool_use_id)),
            None => ManagerOutcome::NotFound(id.to_string()),
        }
    }

    pub async fn interrupt(&self, id: &str) -> ManagerOutcome<Result<()>> {
        match self.record(id) {
            Some(record) => ManagerOutcome::Ok(record.session.interrupt().await),
            None => ManagerOutcome::NotFound(id.to_string()),
        }
    }

    /// Stop a session and forget it
    pub async fn destroy(&self, id: &str) -> ManagerOutcome<()> {
        let Some(record) = self.record(id) else {
            return ManagerOutcome::NotFound(id.to_string());
        };
        tracing::info!(session_id = %id, "Destroying session");
        self.remove(id, &record).await;
        ManagerOutcome::Ok(())
    }

    /// Destroy every session
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.inner.sessions.iter().map(|r| r.key().clone()).collect();
        for id in ids {
            self.destroy(&id).await;
        }
    }

    pub fn history(&self, id: &str) -> ManagerOutcome<Vec<ProviderEvent>> {
        match self.record(id) {
            Some(record) => ManagerOutcome::Ok(lock(&record.state).history.to_vec()),
            None => ManagerOutcome::NotFound(id.to_string()),
        }
    }

    pub fn summary(&self, id: &str) -> ManagerOutcome<SessionSummary> {
        match self.record(id) {
            Some(record) => ManagerOutcome::Ok(record.summary()),
            None => ManagerOutcome::NotFound(id.to_string()),
        }
    }

    pub fn list(&self) -> Vec<SessionSummary> {
        let mut summaries: Vec<_> = self
            .inner
            .sessions
            .iter()
            .map(|r| r.value().summary())
            .collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        summaries
    }

    /// Assistant message following a user message, from history then past messages
    pub fn find_assistant_uuid_after_user(
        &self,
        id: &str,
        user_uuid: &str,
    ) -> ManagerOutcome<Option<String>> {
        let Some(record) = self.record(id) else {
            return ManagerOutcome::NotFound(id.to_string());
        };
        let state = lock(&record.state);
        ManagerOutcome::Ok(
            state
                .history
                .find_assistant_uuid_after_user(user_uuid)
                .or_else(|| find_assistant_uuid_after_user(&state.past_messages, user_uuid)),
        )
    }

    /// Restart a session so the conversation resumes after `user_uuid`'s answer
    pub async fn rewind(&self, id: &str, user_uuid: &str) -> ManagerOutcome<Result<()>> {
        let Some(record) = self.record(id) else {
            return ManagerOutcome::NotFound(id.to_string());
        };
        if !record.session.supports_rewind() {
            return ManagerOutcome::Unsupported {
                backend: record.backend,
                operation: "rewind",
            };
        }

        let span = tracing::info_span!("rewind_session", session_id = %id, user_uuid = %user_uuid);
        ManagerOutcome::Ok(self.rewind_record(record, user_uuid).instrument(span).await)
    }

    async fn rewind_record(&self, record: Arc<SessionRecord>, user_uuid: &str) -> Result<()> {
        let assistant_uuid = self
            .find_assistant_uuid_after_user(&record.id, user_uuid)
            .ok()
            .flatten()
            .ok_or_else(|| {
                AgentError::invalid_state(format!(
                    "no assistant message follows user message {user_uuid}"
                ))
            })?;
        let backend_session_id = record
            .backend_session_id()
            .ok_or_else(|| AgentError::invalid_state("session has no backend id to resume"))?;

        let mut options = record.options.clone();
        options.resume = Some(backend_session_id);
        options.resume_at = Some(assistant_uuid.clone());

        let worktree = record.worktree.as_ref().map(|w| WorktreeOptions {
            create: false,
            branch: w.branch.clone(),
            existing_path: Some(w.path.clone()),
        });
        let request = CreateRequest {
            project_path: record.project_path.clone(),
            backend: record.backend,
            options,
            past_messages: None,
            worktree,
        };

        tracing::info!(resume_at = %assistant_uuid, "Rewinding session");
        self.remove(&record.id, &record).await;
        self.create_with_id(record.id.clone(), request).await
    }

    /// Give a session a caller-chosen title in the backend's session index
    pub async fn rename(&self, id: &str, name: &str) -> ManagerOutcome<Result<()>> {
        let Some(record) = self.record(id) else {
            return ManagerOutcome::NotFound(id.to_string());
        };
        if record.backend != BackendKind::Claude {
            return ManagerOutcome::Unsupported {
                backend: record.backend,
                operation: "rename",
            };
        }
        ManagerOutcome::Ok(self.rename_record(&record, name).await)
    }

    async fn rename_record(&self, record: &SessionRecord, name: &str) -> Result<()> {
        let backend_session_id = record
            .backend_session_id()
            .ok_or_else(|| AgentError::invalid_state("session has no backend id yet"))?;
        let transcript = self
            .inner
            .locate_transcript(record, &backend_session_id)
            .await
            .ok_or_else(|| {
                AgentError::invalid_state(format!("no transcript for {backend_session_id}"))
            })?;
        self.inner
            .transcripts
            .append_title(&transcript, &backend_session_id, name)
            .await?;
        lock(&record.state).name = Some(name.to_string());
        tracing::info!(session_id = %record.id, name = %name, "Renamed session");
        Ok(())
    }
}

impl ManagerInner {
    fn send(&self, record: &SessionRecord, event: HubEvent) {
        if record.closed.is_cancelled() {
            return;
        }
        if self.events.send(event).is_err() {
            tracing::trace!(session_id = %record.id, "Manager receiver dropped");
        }
    }

    fn forward(&self, record: &SessionRecord, event: ProviderEvent) {
        self.send(
            record,
            HubEvent::Message {
                session_id: record.id.clone(),
                event,
            },
        );
    }

    async fn handle_event(&self, record: &SessionRecord, event: ProviderEvent) {
        let is_result = matches!(event, ProviderEvent::Result(_));
        if is_result {
            self.remember_worktree(record);
        }

        let outcome = lock(&record.state).history.push(event.clone());
        match outcome {
            PushOutcome::Merged(updated) => self.forward(record, updated),
            PushOutcome::Appended | PushOutcome::Skipped => self.forward(record, event),
        }

        if is_result && record.backend == BackendKind::Claude {
            self.backfill_from_disk(record).await;
        }
    }

    fn remember_worktree(&self, record: &SessionRecord) {
        let Some(worktree) = &record.worktree else {
            return;
        };
        let Some(backend_session_id) = record.session.backend_session_id() else {
            return;
        };
        {
            let mut state = lock(&record.state);
            if state.mapped {
                return;
            }
            state.mapped = true;
        }
        self.mappings.put(
            &backend_session_id,
            WorktreeMapping {
                worktree_path: worktree.path.clone(),
                branch: worktree.branch.clone(),
                project_path: record.project_path.clone(),
            },
        );
    }

    async fn locate_transcript(&self, record: &SessionRecord, backend_session_id: &str) -> Option<PathBuf> {
        self.transcripts
            .locate(
                backend_session_id,
                &record.project_path,
                record.worktree.as_ref().map(|w| w.path.as_path()),
            )
            .await
    }

    /// Assign transcript UUIDs to user messages that still lack one
    async fn backfill_from_disk(&self, record: &SessionRecord) {
        let Some(backend_session_id) = record.backend_session_id() else {
            return;
        };
        let Some(path) = self.locate_transcript(record, &backend_session_id).await else {
            tracing::debug!(backend_session_id = %backend_session_id, "No transcript to backfill from");
            return;
        };
        let mut queue = match self.transcripts.user_uuid_queue(&path).await {
            Ok(queue) => queue,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to read transcript");
                return;
            }
        };

        let updated = lock(&record.state).history.backfill_user_uuids(&mut queue);
        if !updated.is_empty() {
            tracing::debug!(count = updated.len(), "Backfilled user message ids");
        }
        for event in updated {
            self.forward(record, event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AssistantEvent, ImageRef, ResultEvent, ToolResultEvent, UserInputEvent};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[derive(Debug)]
    struct ScriptedSession {
        id: String,
        backend: BackendKind,
        emitter: EventEmitter,
        backend_id: Mutex<Option<String>>,
        started: Mutex<Option<(PathBuf, StartOptions)>>,
        inputs: Mutex<Vec<String>>,
        stopped: AtomicBool,
        fail_start: bool,
    }

    impl ScriptedSession {
        fn emit(&self, event: ProviderEvent) {
            self.emitter.emit(event);
        }

        fn set_backend_id(&self, id: &str) {
            *self.backend_id.lock().unwrap() = Some(id.to_string());
        }
    }

    #[async_trait]
    impl ProviderSession for ScriptedSession {
        fn id(&self) -> &str {
            &self.id
        }

        fn backend(&self) -> BackendKind {
            self.backend
        }

        fn status(&self) -> SessionStatus {
            SessionStatus::Idle
        }

        fn backend_session_id(&self) -> Option<String> {
            self.backend_id.lock().unwrap().clone()
        }

        async fn start(&self, cwd: PathBuf, options: StartOptions) -> Result<()> {
            if self.fail_start {
                return Err(AgentError::spawn_failed("scripted", "refused"));
            }
            *self.started.lock().unwrap() = Some((cwd, options));
            Ok(())
        }

        async fn stop(&self) {
            self.stopped.store(true, Ordering::SeqCst);
        }

        async fn interrupt(&self) -> Result<()> {
            Ok(())
        }

        fn send_input_with_images(&self, text: String, _images: Vec<ImageAttachment>) {
            self.inputs.lock().unwrap().push(text);
        }

        async fn approve(&self, tool_use_id: Option<&str>, _updated_input: Option<Value>) -> bool {
            tool_use_id == Some("tu-1")
        }

        async fn approve_always(&self, _tool_use_id: Option<&str>) -> bool {
            false
        }

        async fn reject(&self, _tool_use_id: Option<&str>, _message: Option<String>) -> bool {
            false
        }

        async fn answer(&self, _tool_use_id: &str, _result: Value) -> bool {
            false
        }

        fn pending_permission(&self, _tool_use_id: Option<&str>) -> Option<PendingPermission> {
            None
        }

        fn supports_rewind(&self) -> bool {
            self.backend == BackendKind::Claude
        }
    }

    #[derive(Debug, Default)]
    struct ScriptedFactory {
        built: Mutex<Vec<Arc<ScriptedSession>>>,
        fail_start: bool,
    }

    impl ScriptedFactory {
        fn session(&self, index: usize) -> Arc<ScriptedSession> {
            self.built.lock().unwrap()[index].clone()
        }
    }

    impl SessionFactory for ScriptedFactory {
        fn build(
            &self,
            id: &str,
            backend: BackendKind,
            emitter: EventEmitter,
        ) -> Result<Arc<dyn ProviderSession>> {
            let session = Arc::new(ScriptedSession {
                id: id.to_string(),
                backend,
                emitter,
                backend_id: Mutex::new(None),
                started: Mutex::new(None),
                inputs: Mutex::new(Vec::new()),
                stopped: AtomicBool::new(false),
                fail_start: self.fail_start,
            });
            self.built.lock().unwrap().push(session.clone());
            Ok(session)
        }
    }

    fn config(projects_dir: &Path) -> HubConfig {
        HubConfig {
            claude_projects_dir: projects_dir.to_path_buf(),
            ..HubConfig::default()
        }
    }

    fn manager_with(
        factory: Arc<ScriptedFactory>,
        config: HubConfig,
    ) -> (SessionManager, mpsc::UnboundedReceiver<HubEvent>) {
        SessionManager::builder()
            .config(config)
            .factory(factory)
            .build()
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<HubEvent>) -> ProviderEvent {
        match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
            Ok(Some(HubEvent::Message { event, .. })) => event,
            other => panic!("expected a message, got {other:?}"),
        }
    }

    fn user_uuids(events: &[ProviderEvent]) -> Vec<Option<String>> {
        events
            .iter()
            .filter_map(|e| match e {
                ProviderEvent::UserInput(input) => Some(input.user_message_uuid.clone()),
                _ => None,
            })
            .collect()
    }

    fn assistant(uuid: &str) -> ProviderEvent {
        ProviderEvent::Assistant(AssistantEvent {
            uuid: Some(uuid.to_string()),
            ..AssistantEvent::text("ok")
        })
    }

    fn echo(text: &str, uuid: &str) -> ProviderEvent {
        ProviderEvent::UserInput(UserInputEvent {
            text: text.to_string(),
            user_message_uuid: Some(uuid.to_string()),
            image_count: None,
        })
    }

    fn result() -> ProviderEvent {
        ProviderEvent::Result(ResultEvent {
            subtype: "success".to_string(),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_create_and_send_input() {
        let root = tempfile::tempdir().unwrap();
        let factory = Arc::new(ScriptedFactory::default());
        let (manager, mut rx) = manager_with(factory.clone(), config(root.path()));

        let id = manager
            .create(CreateRequest::new("/repo", BackendKind::Codex))
            .await
            .unwrap();
        let session = factory.session(0);
        assert_eq!(session.id, id);
        assert_eq!(
            session.started.lock().unwrap().as_ref().map(|(cwd, _)| cwd.clone()),
            Some(PathBuf::from("/repo"))
        );

        assert!(manager.send_input(&id, "hello", Vec::new()).is_ok());
        assert_eq!(next_event(&mut rx).await, ProviderEvent::user_input("hello", 0));
        assert_eq!(*session.inputs.lock().unwrap(), vec!["hello".to_string()]);
        assert_eq!(manager.history(&id).ok().map(|h| h.len()), Some(1));

        let summaries = manager.list();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].backend, BackendKind::Codex);
        assert_eq!(summaries[0].history_len, 1);

        assert_eq!(manager.approve(&id, Some("tu-1"), None).await, ManagerOutcome::Ok(true));
    }

    #[tokio::test]
    async fn test_unknown_session_is_not_found() {
        let root = tempfile::tempdir().unwrap();
        let (manager, _rx) = manager_with(Arc::default(), config(root.path()));

        fn missing<T>() -> ManagerOutcome<T> {
            ManagerOutcome::NotFound("nope".to_string())
        }
        assert_eq!(manager.send_input("nope", "x", Vec::new()), missing());
        assert_eq!(manager.approve("nope", None, None).await, missing());
        assert_eq!(manager.reject("nope", None, None).await, missing());
        assert_eq!(manager.destroy("nope").await, missing());
        assert!(matches!(
            manager.rewind("nope", "u1").await,
            ManagerOutcome::NotFound(_)
        ));
        assert!(matches!(
            manager.history("nope").into_result(),
            Err(AgentError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_start_failure_removes_session() {
        let root = tempfile::tempdir().unwrap();
        let factory = Arc::new(ScriptedFactory {
            fail_start: true,
            ..Default::default()
        });
        let (manager, _rx) = manager_with(factory.clone(), config(root.path()));

        let err = manager
            .create(CreateRequest::new("/repo", BackendKind::Claude))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::SpawnFailed { .. }));
        assert!(manager.list().is_empty());
        assert!(factory.session(0).stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_echo_merges_into_placeholder() {
        let root = tempfile::tempdir().unwrap();
        let factory = Arc::new(ScriptedFactory::default());
        let (manager, mut rx) = manager_with(factory.clone(), config(root.path()));
        let id = manager
            .create(CreateRequest::new("/repo", BackendKind::Claude))
            .await
            .unwrap();

        manager.send_input(&id, "hi", Vec::new());
        next_event(&mut rx).await;
        factory.session(0).emit(echo("hi", "u-1"));

        assert_eq!(next_event(&mut rx).await, echo("hi", "u-1"));
        let history = manager.history(&id).ok().unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(user_uuids(&history), vec![Some("u-1".to_string())]);
    }

    #[tokio::test]
    async fn test_result_backfills_duplicate_texts_from_disk() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join(crate::manager::project_slug(Path::new("/repo")));
        std::fs::create_dir_all(&dir).unwrap();
        let lines = [
            json!({"type": "user", "uuid": "u-1", "message": {"content": "yes"}}),
            json!({"type": "assistant", "uuid": "a-1", "message": {"content": [{"type": "text", "text": "ok"}]}}),
            json!({"type": "user", "uuid": "u-2", "message": {"content": "yes"}}),
        ];
        let body: String = lines.iter().map(|l| format!("{l}\n")).collect();
        std::fs::write(dir.join("b-1.jsonl"), body).unwrap();

        let factory = Arc::new(ScriptedFactory::default());
        let (manager, mut rx) = manager_with(factory.clone(), config(root.path()));
        let id = manager
            .create(CreateRequest::new("/repo", BackendKind::Claude))
            .await
            .unwrap();
        let session = factory.session(0);
        session.set_backend_id("b-1");

        manager.send_input(&id, "yes", Vec::new());
        manager.send_input(&id, "yes", Vec::new());
        next_event(&mut rx).await;
        next_event(&mut rx).await;

        session.emit(result());
        assert!(matches!(next_event(&mut rx).await, ProviderEvent::Result(_)));
        let refreshed = vec![next_event(&mut rx).await, next_event(&mut rx).await];
        assert_eq!(
            user_uuids(&refreshed),
            vec![Some("u-1".to_string()), Some("u-2".to_string())]
        );
        assert_eq!(
            user_uuids(&manager.history(&id).ok().unwrap()),
            vec![Some("u-1".to_string()), Some("u-2".to_string())]
        );
    }

    #[tokio::test]
    async fn test_rewind_unsupported_on_rpc_backend() {
        let root = tempfile::tempdir().unwrap();
        let (manager, _rx) = manager_with(Arc::default(), config(root.path()));
        let id = manager
            .create(CreateRequest::new("/repo", BackendKind::Codex))
            .await
            .unwrap();

        assert!(matches!(
            manager.rewind(&id, "u1").await,
            ManagerOutcome::Unsupported {
                backend: BackendKind::Codex,
                operation: "rewind"
            }
        ));
        assert!(matches!(
            manager.rename(&id, "x").await,
            ManagerOutcome::Unsupported { .. }
        ));
    }

    #[tokio::test]
    async fn test_rewind_recreates_with_resume_point() {
        let root = tempfile::tempdir().unwrap();
        let factory = Arc::new(ScriptedFactory::default());
        let (manager, mut rx) = manager_with(factory.clone(), config(root.path()));
        let options = StartOptions {
            model: Some("opus".to_string()),
            ..Default::default()
        };
        let id = manager
            .create(CreateRequest::new("/repo", BackendKind::Claude).with_options(options))
            .await
            .unwrap();
        let first = factory.session(0);
        first.set_backend_id("b-1");

        manager.send_input(&id, "one", Vec::new());
        first.emit(echo("one", "u1"));
        first.emit(assistant("a1"));
        for _ in 0..3 {
            next_event(&mut rx).await;
        }
        manager.send_input(&id, "two", Vec::new());
        next_event(&mut rx).await;
        assert_eq!(
            manager.find_assistant_uuid_after_user(&id, "u1"),
            ManagerOutcome::Ok(Some("a1".to_string()))
        );

        let outcome = manager.rewind(&id, "u1").await;
        assert!(matches!(outcome, ManagerOutcome::Ok(Ok(()))));
        assert!(first.stopped.load(Ordering::SeqCst));

        let second = factory.session(1);
        assert_eq!(second.id, id);
        let (_, options) = second.started.lock().unwrap().clone().unwrap();
        assert_eq!(options.resume.as_deref(), Some("b-1"));
        assert_eq!(options.resume_at.as_deref(), Some("a1"));
        assert_eq!(options.model.as_deref(), Some("opus"));
        assert_eq!(manager.history(&id).ok().map(|h| h.len()), Some(0));

        // Events of the replaced session are no longer forwarded
        first.emit(ProviderEvent::error("late"));
        second.emit(ProviderEvent::status(SessionStatus::Idle));
        assert_eq!(
            next_event(&mut rx).await,
            ProviderEvent::status(SessionStatus::Idle)
        );
    }

    #[tokio::test]
    async fn test_rewind_without_following_assistant_fails() {
        let root = tempfile::tempdir().unwrap();
        let factory = Arc::new(ScriptedFactory::default());
        let (manager, _rx) = manager_with(factory.clone(), config(root.path()));
        let id = manager
            .create(CreateRequest::new("/repo", BackendKind::Claude))
            .await
            .unwrap();

        assert!(matches!(
            manager.rewind(&id, "u-unknown").await,
            ManagerOutcome::Ok(Err(AgentError::InvalidState(_)))
        ));
        assert!(!factory.session(0).stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_rewind_lookup_falls_back_to_past_messages() {
        use crate::manager::MessageRole;

        let root = tempfile::tempdir().unwrap();
        let (manager, _rx) = manager_with(Arc::default(), config(root.path()));
        let past = vec![
            PastMessage {
                role: MessageRole::User,
                uuid: "u0".to_string(),
                text: "earlier".to_string(),
            },
            PastMessage {
                role: MessageRole::Assistant,
                uuid: "a0".to_string(),
                text: "answer".to_string(),
            },
        ];
        let id = manager
            .create(CreateRequest::new("/repo", BackendKind::Claude).with_past_messages(past))
            .await
            .unwrap();

        assert_eq!(
            manager.find_assistant_uuid_after_user(&id, "u0"),
            ManagerOutcome::Ok(Some("a0".to_string()))
        );
    }

    #[derive(Debug, Default)]
    struct SlowImages;

    #[async_trait]
    impl ImageStore for SlowImages {
        async fn register_file(&self, _session_id: &str, _path: &Path) -> Result<ImageRef> {
            Err(AgentError::internal("unused"))
        }

        async fn register_inline(
            &self,
            _session_id: &str,
            media_type: &str,
            _data: &str,
        ) -> Result<ImageRef> {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(ImageRef {
                id: "img-1".to_string(),
                path: None,
                media_type: Some(media_type.to_string()),
            })
        }
    }

    #[tokio::test]
    async fn test_slow_enrichment_preserves_order() {
        let root = tempfile::tempdir().unwrap();
        let factory = Arc::new(ScriptedFactory::default());
        let (manager, mut rx) = SessionManager::builder()
            .config(config(root.path()))
            .factory(factory.clone())
            .image_store(Arc::new(SlowImages))
            .build();
        let id = manager
            .create(CreateRequest::new("/repo", BackendKind::Claude))
            .await
            .unwrap();
        let session = factory.session(0);

        session.emit(ProviderEvent::ToolResult(ToolResultEvent {
            tool_use_id: "tu-1".to_string(),
            content: json!("screenshot"),
            raw_blocks: Some(vec![json!({
                "type": "image",
                "source": {"type": "base64", "media_type": "image/png", "data": "aGk="}
            })]),
            ..Default::default()
        }));
        session.emit(ProviderEvent::StreamDelta {
            text: "after".to_string(),
        });

        match next_event(&mut rx).await {
            ProviderEvent::ToolResult(result) => {
                assert_eq!(result.images.map(|i| i.len()), Some(1));
                assert!(result.raw_blocks.is_none());
            }
            other => panic!("expected tool_result first, got {other:?}"),
        }
        assert!(matches!(
            next_event(&mut rx).await,
            ProviderEvent::StreamDelta { .. }
        ));
        // Deltas are forwarded but not buffered
        assert_eq!(manager.history(&id).ok().map(|h| h.len()), Some(1));
    }

    #[tokio::test]
    async fn test_input_placeholder_waits_behind_queued_events() {
        let root = tempfile::tempdir().unwrap();
        let factory = Arc::new(ScriptedFactory::default());
        let (manager, mut rx) = SessionManager::builder()
            .config(config(root.path()))
            .factory(factory.clone())
            .image_store(Arc::new(SlowImages))
            .build();
        let id = manager
            .create(CreateRequest::new("/repo", BackendKind::Claude))
            .await
            .unwrap();
        let session = factory.session(0);
        session.set_backend_id("b-1");

        manager.send_input(&id, "one", Vec::new());
        session.emit(echo("one", "u1"));
        session.emit(ProviderEvent::ToolResult(ToolResultEvent {
            tool_use_id: "tu-1".to_string(),
            content: json!("screenshot"),
            raw_blocks: Some(vec![json!({
                "type": "image",
                "source": {"type": "base64", "media_type": "image/png", "data": "aGk="}
            })]),
            ..Default::default()
        }));
        session.emit(assistant("a1"));
        // Sent while the tool result is still being enriched
        manager.send_input(&id, "two", Vec::new());

        let mut forwarded = Vec::new();
        for _ in 0..5 {
            forwarded.push(next_event(&mut rx).await.kind());
        }
        assert_eq!(
            forwarded,
            vec!["user_input", "user_input", "tool_result", "assistant", "user_input"]
        );

        let history = manager.history(&id).ok().unwrap();
        let kinds: Vec<_> = history.iter().map(ProviderEvent::kind).collect();
        assert_eq!(
            kinds,
            vec!["user_input", "tool_result", "assistant", "user_input"]
        );
        assert_eq!(
            user_uuids(&history),
            vec![Some("u1".to_string()), None]
        );
        assert_eq!(
            manager.find_assistant_uuid_after_user(&id, "u1"),
            ManagerOutcome::Ok(Some("a1".to_string()))
        );
    }

    #[tokio::test]
    async fn test_history_capped_by_config() {
        let root = tempfile::tempdir().unwrap();
        let factory = Arc::new(ScriptedFactory::default());
        let (manager, mut rx) = manager_with(
            factory.clone(),
            HubConfig {
                history_limit: 3,
                ..config(root.path())
            },
        );
        let id = manager
            .create(CreateRequest::new("/repo", BackendKind::Codex))
            .await
            .unwrap();
        let session = factory.session(0);

        for n in 0..5 {
            session.emit(ProviderEvent::warning(format!("w{n}")));
        }
        for _ in 0..5 {
            next_event(&mut rx).await;
        }
        assert_eq!(manager.history(&id).ok().map(|h| h.len()), Some(3));
    }

    #[tokio::test]
    async fn test_worktree_mapping_recorded_and_reused() {
        let root = tempfile::tempdir().unwrap();
        let factory = Arc::new(ScriptedFactory::default());
        let mappings = Arc::new(MemoryWorktreeMappings::new());
        let (manager, mut rx) = SessionManager::builder()
            .config(config(root.path()))
            .factory(factory.clone())
            .worktree_mappings(mappings.clone())
            .build();

        let id = manager
            .create(
                CreateRequest::new("/repo", BackendKind::Claude).with_worktree(WorktreeOptions {
                    existing_path: Some(PathBuf::from("/repo/.worktrees/feat")),
                    branch: Some("feat".to_string()),
                    ..Default::default()
                }),
            )
            .await
            .unwrap();
        let session = factory.session(0);
        session.set_backend_id("b-7");
        session.emit(result());
        next_event(&mut rx).await;

        let mapping = mappings.get("b-7").unwrap();
        assert_eq!(mapping.worktree_path, PathBuf::from("/repo/.worktrees/feat"));
        assert_eq!(mapping.project_path, PathBuf::from("/repo"));
        assert_eq!(mapping.branch.as_deref(), Some("feat"));
        assert_eq!(
            manager.summary(&id).ok().and_then(|s| s.worktree).map(|w| w.path),
            Some(PathBuf::from("/repo/.worktrees/feat"))
        );

        manager
            .create(
                CreateRequest::new("/repo", BackendKind::Claude)
                    .with_options(StartOptions::with_resume("b-7")),
            )
            .await
            .unwrap();
        let (cwd, _) = factory.session(1).started.lock().unwrap().clone().unwrap();
        assert_eq!(cwd, PathBuf::from("/repo/.worktrees/feat"));
    }

    #[tokio::test]
    async fn test_create_worktree_without_provider_fails() {
        let root = tempfile::tempdir().unwrap();
        let (manager, _rx) = manager_with(Arc::default(), config(root.path()));

        let err = manager
            .create(
                CreateRequest::new("/repo", BackendKind::Codex).with_worktree(WorktreeOptions {
                    create: true,
                    ..Default::default()
                }),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::ConfigError(_)));
    }

    #[tokio::test]
    async fn test_rename_appends_title() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join(crate::manager::project_slug(Path::new("/repo")));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("b-1.jsonl"), "").unwrap();

        let factory = Arc::new(ScriptedFactory::default());
        let (manager, _rx) = manager_with(factory.clone(), config(root.path()));
        let id = manager
            .create(CreateRequest::new("/repo", BackendKind::Claude))
            .await
            .unwrap();
        factory.session(0).set_backend_id("b-1");

        assert!(matches!(manager.rename(&id, "Auth refactor").await, ManagerOutcome::Ok(Ok(()))));
        let index = std::fs::read_to_string(dir.join("sessions-index.jsonl")).unwrap();
        assert!(index.contains("Auth refactor"));
        assert_eq!(
            manager.summary(&id).ok().and_then(|s| s.name).as_deref(),
            Some("Auth refactor")
        );
    }

    #[tokio::test]
    async fn test_session_exit_forwarded() {
        let root = tempfile::tempdir().unwrap();
        let factory = Arc::new(ScriptedFactory::default());
        let (manager, mut rx) = manager_with(factory.clone(), config(root.path()));
        let id = manager
            .create(CreateRequest::new("/repo", BackendKind::Codex))
            .await
            .unwrap();

        factory.session(0).emitter.exit(Some(1));
        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap();
        assert_eq!(
            event,
            Some(HubEvent::Exited {
                session_id: id,
                code: Some(1)
            })
        );
    }
}
