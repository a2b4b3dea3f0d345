//! Provider session driven through an injected agent query
//!
//! The backend owns the conversation; this session feeds it inputs from the
//! mailbox, converts its stream-json messages into uniform events, and gates
//! tool calls through the permission callback.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{Value, json};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::delegate::{
    AgentConnection, AgentQuery, GateDecision, GateRequest, PermissionGate, QueryRequest,
};
use crate::settings::SessionRules;
use crate::types::{
    AgentError, AssistantEvent, BackendKind, HubConfig, ImageAttachment, ProviderEvent, Result,
    ResultEvent, SessionStatus, StartOptions, SystemEvent, TokenUsage, ToolResultEvent,
    ToolUseSummaryEvent, UserInputEvent,
};

use super::approvals::{ApprovalDecision, PendingEntry, PendingPermission, PendingTable};
use super::lock;
use super::mailbox::{Delivery, InputMailbox};
use super::permission::{GateCheck, PermissionMode, check_tool};
use super::provider::{EventEmitter, EventReceiver, ProviderSession, TurnInput, event_channel};
use super::usage::TurnCounters;

/// How long `stop` waits for the turn task to wind down
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Settings for a delegate-variant session
#[derive(Debug, Clone)]
pub struct DelegateSessionConfig {
    /// Leave `starting` after this long even without an init message
    pub init_fallback: Duration,
    pub image_dir: PathBuf,
}

impl From<&HubConfig> for DelegateSessionConfig {
    fn from(config: &HubConfig) -> Self {
        Self {
            init_fallback: config.init_fallback,
            image_dir: config.image_temp_dir.clone(),
        }
    }
}

#[derive(Debug)]
struct DelegateApproval {
    tool_name: String,
    input: Value,
    responder: oneshot::Sender<ApprovalDecision>,
}

impl PendingEntry for DelegateApproval {
    fn tool_name(&self) -> &str {
        &self.tool_name
    }

    fn input(&self) -> &Value {
        &self.input
    }
}

struct Inner {
    id: String,
    query: Arc<dyn AgentQuery>,
    config: DelegateSessionConfig,
    emitter: EventEmitter,
    status: Mutex<SessionStatus>,
    backend_session_id: Mutex<Option<String>>,
    connection: Mutex<Option<Arc<dyn AgentConnection>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    mailbox: InputMailbox<TurnInput>,
    approvals: PendingTable<DelegateApproval>,
    rules: Mutex<SessionRules>,
    mode: Mutex<PermissionMode>,
    counters: Arc<TurnCounters>,
    shutdown: CancellationToken,
    stopped: AtomicBool,
}

impl std::fmt::Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelegateSession")
            .field("id", &self.id)
            .field("status", &*lock(&self.status))
            .field("backend_session_id", &*lock(&self.backend_session_id))
            .field("pending_approvals", &self.approvals.len())
            .finish_non_exhaustive()
    }
}

/// Session backed by an [`AgentQuery`]
#[derive(Debug)]
pub struct DelegateSession {
    inner: Arc<Inner>,
}

impl DelegateSession {
    pub fn new(
        id: impl Into<String>,
        query: Arc<dyn AgentQuery>,
        config: DelegateSessionConfig,
    ) -> (Self, EventReceiver) {
        let (emitter, events) = event_channel();
        (Self::with_emitter(id, query, config, emitter), events)
    }

    /// Create a session that emits onto an existing queue
    pub fn with_emitter(
        id: impl Into<String>,
        query: Arc<dyn AgentQuery>,
        config: DelegateSessionConfig,
        emitter: EventEmitter,
    ) -> Self {
        let inner = Arc::new(Inner {
            id: id.into(),
            query,
            config,
            emitter,
            status: Mutex::new(SessionStatus::Starting),
            backend_session_id: Mutex::new(None),
            connection: Mutex::new(None),
            task: Mutex::new(None),
            mailbox: InputMailbox::new(),
            approvals: PendingTable::new(),
            rules: Mutex::new(SessionRules::new()),
            mode: Mutex::new(PermissionMode::Default),
            counters: Arc::new(TurnCounters::new()),
            shutdown: CancellationToken::new(),
            stopped: AtomicBool::new(false),
        });
        Self { inner }
    }

    pub fn permission_mode(&self) -> PermissionMode {
        *lock(&self.inner.mode)
    }

    pub fn set_permission_mode(&self, mode: PermissionMode) {
        tracing::info!(session_id = %self.inner.id, mode = mode.as_str(), "Setting permission mode");
        *lock(&self.inner.mode) = mode;
    }
}

#[async_trait]
impl ProviderSession for DelegateSession {
    fn id(&self) -> &str {
        &self.inner.id
    }

    fn backend(&self) -> BackendKind {
        BackendKind::Claude
    }

    fn status(&self) -> SessionStatus {
        *lock(&self.inner.status)
    }

    fn backend_session_id(&self) -> Option<String> {
        lock(&self.inner.backend_session_id).clone()
    }

    async fn start(&self, cwd: PathBuf, options: StartOptions) -> Result<()> {
        let inner = &self.inner;
        if let Some(mode) = options.permission_mode.as_deref().and_then(PermissionMode::parse) {
            *lock(&inner.mode) = mode;
        }
        if let Some(ref resume) = options.resume {
            *lock(&inner.backend_session_id) = Some(resume.clone());
        }

        let request = QueryRequest {
            cwd,
            options,
            gate: inner.gate(),
            counters: Arc::clone(&inner.counters),
            image_dir: inner.config.image_dir.clone(),
        };
        let connection = match inner.query.open(request).await {
            Ok(connection) => connection,
            Err(e) => {
                tracing::error!(session_id = %inner.id, error = %e, "Failed to open delegate backend");
                inner.emitter.emit(ProviderEvent::error(e.to_string()));
                inner.set_status(SessionStatus::Idle);
                inner.emitter.exit(Some(1));
                return Err(e);
            }
        };
        *lock(&inner.connection) = Some(Arc::clone(&connection));

        let span = tracing::info_span!("delegate_session", session_id = %inner.id);
        tokio::spawn(Arc::clone(inner).init_fallback().instrument(span.clone()));
        let task = tokio::spawn(Arc::clone(inner).run(connection).instrument(span));
        *lock(&inner.task) = Some(task);
        Ok(())
    }

    async fn stop(&self) {
        let inner = &self.inner;
        if inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(session_id = %inner.id, "Stopping delegate session");

        inner.shutdown.cancel();
        inner.mailbox.close();
        let abandoned = inner.approvals.clear();
        if abandoned > 0 {
            tracing::debug!(session_id = %inner.id, abandoned, "Abandoned pending approvals");
        }

        let task = lock(&inner.task).take();
        if let Some(task) = task {
            if tokio::time::timeout(STOP_GRACE, task).await.is_err() {
                tracing::warn!(session_id = %inner.id, "Turn task did not finish in time");
            }
        }
        inner.set_status(SessionStatus::Idle);
    }

    async fn interrupt(&self) -> Result<()> {
        let inner = &self.inner;
        let connection = lock(&inner.connection)
            .clone()
            .ok_or_else(|| AgentError::invalid_state("session not started"))?;
        tracing::info!(session_id = %inner.id, "Interrupting turn");
        connection.interrupt().await
    }

    fn send_input_with_images(&self, text: String, images: Vec<ImageAttachment>) {
        let inner = &self.inner;
        match inner.mailbox.send(TurnInput { text, images }) {
            Delivery::Delivered => tracing::debug!(session_id = %inner.id, "Input delivered"),
            Delivery::Queued { replaced } => {
                tracing::debug!(session_id = %inner.id, replaced, "Input queued");
            }
            Delivery::Closed => {
                tracing::warn!(session_id = %inner.id, "Input dropped, session is closed");
            }
        }
    }

    async fn approve(&self, tool_use_id: Option<&str>, updated_input: Option<Value>) -> bool {
        self.inner
            .resolve(tool_use_id, ApprovalDecision::Approve { updated_input })
    }

    async fn approve_always(&self, tool_use_id: Option<&str>) -> bool {
        self.inner.resolve(tool_use_id, ApprovalDecision::ApproveAlways)
    }

    async fn reject(&self, tool_use_id: Option<&str>, message: Option<String>) -> bool {
        self.inner
            .resolve(tool_use_id, ApprovalDecision::Reject { message })
    }

    async fn answer(&self, tool_use_id: &str, result: Value) -> bool {
        self.inner
            .resolve(Some(tool_use_id), ApprovalDecision::Answer(result))
    }

    fn pending_permission(&self, tool_use_id: Option<&str>) -> Option<PendingPermission> {
        self.inner.approvals.view(tool_use_id)
    }

    fn supports_rewind(&self) -> bool {
        true
    }
}

/// Withdraws a forwarded approval if the gate future is dropped unresolved
struct PendingGuard<'a> {
    inner: &'a Inner,
    tool_use_id: &'a str,
    armed: bool,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if !self.armed || self.inner.approvals.take(Some(self.tool_use_id)).is_none() {
            return;
        }
        tracing::info!(tool_use_id = %self.tool_use_id, "Approval request dropped by backend");
        self.inner.leave_waiting_approval();
    }
}

impl Inner {
    fn leave_waiting_approval(&self) {
        if self.approvals.is_empty() && *lock(&self.status) == SessionStatus::WaitingApproval {
            self.set_status(SessionStatus::Running);
        }
    }

    fn set_status(&self, status: SessionStatus) {
        {
            let mut current = lock(&self.status);
            if *current == status {
                return;
            }
            *current = status;
        }
        self.emitter.status(status);
    }

    fn gate(self: &Arc<Self>) -> PermissionGate {
        let weak: Weak<Self> = Arc::downgrade(self);
        Arc::new(move |request: GateRequest| {
            let weak = weak.clone();
            Box::pin(async move {
                match weak.upgrade() {
                    Some(inner) => inner.check_permission(request).await,
                    None => GateDecision::deny("Session closed"),
                }
            })
        })
    }

    async fn check_permission(&self, request: GateRequest) -> GateDecision {
        let GateRequest {
            correlation_id,
            tool_name,
            input,
            abort,
        } = request;

        let check = {
            let mode = *lock(&self.mode);
            let rules = lock(&self.rules);
            check_tool(mode, &rules, &tool_name, &input)
        };
        match check {
            GateCheck::AllowedByMode => {
                tracing::debug!(tool_name = %tool_name, "Auto-approved by permission mode");
                return GateDecision::allow();
            }
            GateCheck::AllowedByRule(rule) => {
                tracing::info!(tool_name = %tool_name, rule = %rule, "Auto-approved by session rule");
                return GateDecision::allow();
            }
            GateCheck::Forward => {}
        }

        if self.stopped.load(Ordering::SeqCst) {
            return GateDecision::deny("Session stopped");
        }

        let (tx, rx) = oneshot::channel();
        self.approvals.insert(
            correlation_id.clone(),
            DelegateApproval {
                tool_name: tool_name.clone(),
                input: input.clone(),
                responder: tx,
            },
        );
        tracing::info!(tool_use_id = %correlation_id, tool_name = %tool_name, "Approval requested");
        self.emitter.emit(ProviderEvent::permission_request(
            &correlation_id,
            &tool_name,
            input.clone(),
        ));
        self.set_status(SessionStatus::WaitingApproval);

        let mut guard = PendingGuard {
            inner: self,
            tool_use_id: &correlation_id,
            armed: true,
        };
        let decision = tokio::select! {
            decision = rx => decision.ok(),
            () = abort.cancelled() => {
                tracing::info!(tool_use_id = %correlation_id, "Approval request aborted");
                self.approvals.take(Some(&correlation_id));
                Some(ApprovalDecision::TimedOut)
            }
        };
        guard.armed = false;
        drop(guard);

        self.leave_waiting_approval();

        match decision {
            Some(ApprovalDecision::Approve { updated_input }) => {
                GateDecision::Allow { updated_input }
            }
            Some(ApprovalDecision::ApproveAlways) => GateDecision::allow(),
            Some(ApprovalDecision::Answer(answers)) => GateDecision::Allow {
                updated_input: Some(merge_answers(input, answers)),
            },
            Some(ApprovalDecision::Reject { message }) => GateDecision::deny(
                message.unwrap_or_else(|| "The user denied this tool call".to_string()),
            ),
            Some(ApprovalDecision::TimedOut) => GateDecision::deny("Permission request timed out"),
            None => GateDecision::deny("Session stopped"),
        }
    }

    fn resolve(&self, tool_use_id: Option<&str>, decision: ApprovalDecision) -> bool {
        let Some((id, approval)) = self.approvals.take(tool_use_id) else {
            tracing::debug!(tool_use_id = ?tool_use_id, "No pending approval to resolve");
            return false;
        };
        tracing::info!(tool_use_id = %id, tool_name = %approval.tool_name, ?decision, "Resolving approval");

        if decision == ApprovalDecision::ApproveAlways {
            let rule = lock(&self.rules).allow_always(&approval.tool_name, &approval.input);
            tracing::info!(rule = %rule, "Added session allow-rule");
        }
        if approval.responder.send(decision).is_err() {
            tracing::debug!(tool_use_id = %id, "Approval waiter already gone");
        }
        true
    }

    async fn init_fallback(self: Arc<Self>) {
        tokio::select! {
            () = tokio::time::sleep(self.config.init_fallback) => {}
            () = self.shutdown.cancelled() => return,
        }
        if *lock(&self.status) == SessionStatus::Starting {
            tracing::debug!("No init message yet, marking session idle");
            self.set_status(SessionStatus::Idle);
        }
    }

    async fn run(self: Arc<Self>, connection: Arc<dyn AgentConnection>) {
        loop {
            let input = tokio::select! {
                () = self.shutdown.cancelled() => break,
                input = self.mailbox.recv() => match input {
                    Some(input) => input,
                    None => break,
                },
            };
            if !self.run_turn(connection.as_ref(), input).await {
                break;
            }
        }

        if let Err(e) = connection.close().await {
            tracing::warn!(error = %e, "Failed to close delegate backend");
        }
        self.approvals.clear();
        self.set_status(SessionStatus::Idle);
        self.emitter.exit(Some(0));
        tracing::debug!("Delegate session finished");
    }

    /// Drive one turn; returns false once the session is shutting down
    async fn run_turn(&self, connection: &dyn AgentConnection, input: TurnInput) -> bool {
        self.set_status(SessionStatus::Running);

        if let Err(e) = connection.send(input).await {
            tracing::warn!(error = %e, "Failed to submit input");
            self.emitter.emit(ProviderEvent::error(e.to_string()));
            self.set_status(SessionStatus::Idle);
            return !self.shutdown.is_cancelled();
        }

        let mut messages = connection.receive_turn();
        loop {
            let next = tokio::select! {
                () = self.shutdown.cancelled() => return false,
                next = messages.next() => next,
            };
            match next {
                Some(Ok(message)) => self.handle_message(&message),
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "Delegate stream failed");
                    self.emitter.emit(ProviderEvent::error(e.to_string()));
                    break;
                }
                None => break,
            }
        }

        self.set_status(SessionStatus::Idle);
        true
    }

    fn handle_message(&self, message: &Value) {
        for event in convert_message(message) {
            let event = match event {
                ProviderEvent::System(system) => {
                    if let Some(ref session_id) = system.session_id {
                        *lock(&self.backend_session_id) = Some(session_id.clone());
                    }
                    if system.subtype == "init" && *lock(&self.status) == SessionStatus::Starting {
                        self.set_status(SessionStatus::Idle);
                    }
                    ProviderEvent::System(system)
                }
                ProviderEvent::Result(mut result) => {
                    let activity = self.counters.take();
                    result.tool_calls = Some(activity.tool_calls);
                    result.file_edits = Some(activity.file_edits);
                    if let Some(ref session_id) = result.session_id {
                        *lock(&self.backend_session_id) = Some(session_id.clone());
                    }
                    tracing::info!(
                        subtype = %result.subtype,
                        tool_calls = activity.tool_calls,
                        file_edits = activity.file_edits,
                        "Turn completed"
                    );
                    ProviderEvent::Result(result)
                }
                other => other,
            };
            self.emitter.emit(event);
        }
    }
}

/// Attach caller answers to the question tool's input
fn merge_answers(input: Value, answers: Value) -> Value {
    let answers = answers.get("answers").cloned().unwrap_or(answers);
    match input {
        Value::Object(mut map) => {
            map.insert("answers".to_string(), answers);
            Value::Object(map)
        }
        _ => json!({"answers": answers}),
    }
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(String::from)
}

fn string_list(value: &Value, key: &str) -> Option<Vec<String>> {
    value.get(key).and_then(Value::as_array).map(|items| {
        items
            .iter()
            .filter_map(|item| {
                item.as_str()
                    .map(String::from)
                    .or_else(|| str_field(item, "name"))
            })
            .collect()
    })
}

/// Convert one stream-json message into uniform events
fn convert_message(message: &Value) -> Vec<ProviderEvent> {
    match message.get("type").and_then(Value::as_str) {
        Some("system") => vec![ProviderEvent::System(SystemEvent {
            subtype: str_field(message, "subtype").unwrap_or_default(),
            session_id: str_field(message, "session_id"),
            model: str_field(message, "model"),
            slash_commands: string_list(message, "slash_commands"),
            skills: string_list(message, "skills"),
        })],
        Some("assistant") => vec![ProviderEvent::Assistant(AssistantEvent {
            message: message.get("message").cloned().unwrap_or(Value::Null),
            uuid: str_field(message, "uuid"),
        })],
        Some("user") => convert_user_message(message),
        Some("result") => vec![ProviderEvent::Result(convert_result(message))],
        Some("stream_event") => convert_stream_event(message).into_iter().collect(),
        Some("tool_use_summary") => vec![ProviderEvent::ToolUseSummary(ToolUseSummaryEvent {
            summary: str_field(message, "summary").unwrap_or_default(),
            preceding_tool_use_ids: string_list(message, "preceding_tool_use_ids")
                .unwrap_or_default(),
        })],
        other => {
            tracing::trace!(message_type = ?other, "Ignoring delegate message");
            Vec::new()
        }
    }
}

fn convert_user_message(message: &Value) -> Vec<ProviderEvent> {
    let content = message.pointer("/message/content").unwrap_or(&Value::Null);
    let blocks = match content {
        Value::String(text) => return user_echo(message, text.clone()),
        Value::Array(blocks) => blocks,
        _ => return Vec::new(),
    };

    let results: Vec<ProviderEvent> = blocks
        .iter()
        .filter(|block| block.get("type").and_then(Value::as_str) == Some("tool_result"))
        .filter_map(|block| {
            let tool_use_id = str_field(block, "tool_use_id")?;
            let content = block.get("content").cloned().unwrap_or(Value::Null);
            Some(ProviderEvent::ToolResult(ToolResultEvent {
                tool_use_id,
                raw_blocks: content.as_array().cloned(),
                content,
                is_error: block
                    .get("is_error")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
                ..Default::default()
            }))
        })
        .collect();
    if !results.is_empty() {
        return results;
    }

    let text = blocks
        .iter()
        .filter(|block| block.get("type").and_then(Value::as_str) == Some("text"))
        .filter_map(|block| block.get("text").and_then(Value::as_str))
        .collect::<Vec<_>>()
        .join("\n");
    user_echo(message, text)
}

/// Echo of caller input; only useful once it carries the stable uuid
fn user_echo(message: &Value, text: String) -> Vec<ProviderEvent> {
    let synthetic = ["isSynthetic", "isMeta"]
        .iter()
        .any(|key| message.get(*key).and_then(Value::as_bool) == Some(true));
    match str_field(message, "uuid") {
        Some(uuid) if !synthetic && !text.is_empty() => {
            vec![ProviderEvent::UserInput(UserInputEvent {
                text,
                user_message_uuid: Some(uuid),
                image_count: None,
            })]
        }
        _ => Vec::new(),
    }
}

fn convert_result(message: &Value) -> ResultEvent {
    let subtype = str_field(message, "subtype").unwrap_or_else(|| "success".to_string());
    let is_error = message
        .get("is_error")
        .and_then(Value::as_bool)
        .unwrap_or(false)
        || subtype != "success";
    let text = str_field(message, "result");

    let (result, error) = if is_error {
        let error = text.or_else(|| {
            message
                .get("errors")
                .and_then(Value::as_array)
                .map(|errors| {
                    errors
                        .iter()
                        .filter_map(Value::as_str)
                        .collect::<Vec<_>>()
                        .join("; ")
                })
                .filter(|joined| !joined.is_empty())
        });
        (None, Some(error.unwrap_or_else(|| subtype.clone())))
    } else {
        (text, None)
    };

    ResultEvent {
        subtype: if is_error && subtype == "success" {
            "error".to_string()
        } else {
            subtype
        },
        result,
        error,
        cost_usd: message.get("total_cost_usd").and_then(Value::as_f64),
        duration_ms: message.get("duration_ms").and_then(Value::as_u64),
        session_id: str_field(message, "session_id"),
        token_usage: message
            .get("usage")
            .filter(|usage| usage.is_object())
            .map(TokenUsage::from_sdk_usage),
        tool_calls: None,
        file_edits: None,
    }
}

fn convert_stream_event(message: &Value) -> Option<ProviderEvent> {
    let event = message.get("event")?;
    if event.get("type").and_then(Value::as_str) != Some("content_block_delta") {
        return None;
    }
    let delta = event.get("delta")?;
    if let Some(text) = delta.get("text").and_then(Value::as_str) {
        return Some(ProviderEvent::StreamDelta {
            text: text.to_string(),
        });
    }
    delta
        .get("thinking")
        .and_then(Value::as_str)
        .map(|thinking| ProviderEvent::ThinkingDelta {
            text: thinking.to_string(),
        })
}
