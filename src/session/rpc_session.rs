//! Provider session for JSON-RPC app-server backends
//!
//! Bootstrap: `initialize` → `initialized` → `thread/start` | `thread/resume`,
//! then a turn loop suspended on the input mailbox. A turn ends only on the
//! `turn/completed` notification; the `turn/start` response merely confirms
//! acceptance and carries the turn id used for interrupts.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::{Map, Value, json};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::rpc::{CloseReason, Incoming, Notification, RpcChannel, RpcTransport, ServerRequest};
use crate::settings::SessionRules;
use crate::types::{
    AgentError, AssistantEvent, BackendKind, CollaborationMode, HubConfig, ImageAttachment,
    ProviderEvent, Result, ResultEvent, SessionStatus, StartOptions, SystemEvent, TokenUsage,
    ToolResultEvent,
};

use super::approvals::{ApprovalDecision, PendingEntry, PendingPermission, PendingTable};
use super::images::materialize_images;
use super::lock;
use super::mailbox::{Delivery, InputMailbox};
use super::provider::{EventEmitter, EventReceiver, ProviderSession, TurnInput, event_channel};

const PLAN_TOOL: &str = "ExitPlanMode";
const USER_INPUT_TOOL: &str = "AskUserQuestion";
const PLAN_EXECUTE_PREFIX: &str = "Execute the following plan:\n\n";
/// How long exit handling waits for buffered output to drain
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Settings for an RPC-variant session
#[derive(Debug, Clone)]
pub struct RpcSessionConfig {
    pub rpc_timeout: Option<Duration>,
    pub image_dir: PathBuf,
}

impl From<&HubConfig> for RpcSessionConfig {
    fn from(config: &HubConfig) -> Self {
        Self {
            rpc_timeout: config.rpc_timeout,
            image_dir: config.image_temp_dir.clone(),
        }
    }
}

#[derive(Debug)]
enum ApprovalKind {
    Command,
    FileChange,
    UserInput,
    /// Synthetic plan approval, answered inside the turn loop
    PlanExit(oneshot::Sender<ApprovalDecision>),
}

#[derive(Debug)]
struct RpcApproval {
    request_id: Option<Value>,
    tool_name: String,
    input: Value,
    kind: ApprovalKind,
}

impl PendingEntry for RpcApproval {
    fn tool_name(&self) -> &str {
        &self.tool_name
    }

    fn input(&self) -> &Value {
        &self.input
    }
}

#[derive(Debug)]
struct TurnOutcome {
    status: String,
    error: Option<String>,
}

#[derive(Debug, Default)]
struct TurnState {
    active_turn_id: Option<String>,
    completion: Option<oneshot::Sender<TurnOutcome>>,
    plan_text: String,
    /// Plan text came from a plan item, not from a step list
    plan_from_item: bool,
    usage: Option<TokenUsage>,
}

#[derive(Debug)]
struct Inner {
    id: String,
    transport: Arc<dyn RpcTransport>,
    config: RpcSessionConfig,
    emitter: EventEmitter,
    status: Mutex<SessionStatus>,
    thread_id: Mutex<Option<String>>,
    channel: Mutex<Option<Arc<RpcChannel>>>,
    shutdown: Mutex<Option<CancellationToken>>,
    mailbox: InputMailbox<TurnInput>,
    approvals: PendingTable<RpcApproval>,
    rules: Mutex<SessionRules>,
    turn: Mutex<TurnState>,
    mode: Mutex<CollaborationMode>,
    effort: Mutex<Option<String>>,
    stopped: AtomicBool,
    /// Bootstrap failed and was already reported
    bootstrap_failed: AtomicBool,
}

/// Session backed by a JSON-RPC app-server process
#[derive(Debug)]
pub struct RpcSession {
    inner: Arc<Inner>,
}

impl RpcSession {
    /// Create a session and its outbound event queue
    pub fn new(
        id: impl Into<String>,
        transport: Arc<dyn RpcTransport>,
        config: RpcSessionConfig,
    ) -> (Self, EventReceiver) {
        let (emitter, events) = event_channel();
        (Self::with_emitter(id, transport, config, emitter), events)
    }

    /// Create a session that emits onto an existing queue
    pub fn with_emitter(
        id: impl Into<String>,
        transport: Arc<dyn RpcTransport>,
        config: RpcSessionConfig,
        emitter: EventEmitter,
    ) -> Self {
        let inner = Arc::new(Inner {
            id: id.into(),
            transport,
            config,
            emitter,
            status: Mutex::new(SessionStatus::Starting),
            thread_id: Mutex::new(None),
            channel: Mutex::new(None),
            shutdown: Mutex::new(None),
            mailbox: InputMailbox::new(),
            approvals: PendingTable::new(),
            rules: Mutex::new(SessionRules::new()),
            turn: Mutex::new(TurnState::default()),
            mode: Mutex::new(CollaborationMode::Default),
            effort: Mutex::new(None),
            stopped: AtomicBool::new(false),
            bootstrap_failed: AtomicBool::new(false),
        });
        Self { inner }
    }

    /// Current collaboration mode
    pub fn collaboration_mode(&self) -> CollaborationMode {
        *lock(&self.inner.mode)
    }
}

#[async_trait]
impl ProviderSession for RpcSession {
    fn id(&self) -> &str {
        &self.inner.id
    }

    fn backend(&self) -> BackendKind {
        BackendKind::Codex
    }

    fn status(&self) -> SessionStatus {
        *lock(&self.inner.status)
    }

    fn backend_session_id(&self) -> Option<String> {
        lock(&self.inner.thread_id).clone()
    }

    async fn start(&self, cwd: PathBuf, options: StartOptions) -> Result<()> {
        let inner = &self.inner;
        *lock(&inner.mode) = options.collaboration_mode;
        lock(&inner.effort).clone_from(&options.effort);
        if let Some(ref thread_id) = options.resume {
            *lock(&inner.thread_id) = Some(thread_id.clone());
        }

        let io = match inner.transport.connect(&cwd).await {
            Ok(io) => io,
            Err(e) => {
                tracing::error!(session_id = %inner.id, error = %e, "Failed to start backend");
                inner.emitter.emit(ProviderEvent::error(e.to_string()));
                inner.set_status(SessionStatus::Idle);
                inner.emitter.exit(Some(1));
                return Err(e);
            }
        };

        let (channel, incoming, _reader) =
            RpcChannel::spawn(io.reader, io.writer, inner.config.rpc_timeout);
        *lock(&inner.channel) = Some(Arc::clone(&channel));
        *lock(&inner.shutdown) = Some(io.shutdown);

        let span = tracing::info_span!("rpc_session", session_id = %inner.id);
        let router = tokio::spawn(
            Arc::clone(inner)
                .route_incoming(Arc::clone(&channel), incoming)
                .instrument(span.clone()),
        );
        tokio::spawn(
            Arc::clone(inner)
                .watch_exit(Arc::clone(&channel), io.exit, router)
                .instrument(span.clone()),
        );
        tokio::spawn(Arc::clone(inner).run(channel, cwd, options).instrument(span));
        Ok(())
    }

    async fn stop(&self) {
        let inner = &self.inner;
        if inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(session_id = %inner.id, "Stopping RPC session");

        if let Some(channel) = inner.channel() {
            channel.close(CloseReason::Stopped);
        }
        if let Some(token) = lock(&inner.shutdown).take() {
            token.cancel();
        }
        inner.mailbox.close();
        lock(&inner.turn).completion = None;
        let abandoned = inner.approvals.clear();
        if abandoned > 0 {
            tracing::debug!(session_id = %inner.id, abandoned, "Abandoned pending approvals");
        }
        inner.set_status(SessionStatus::Idle);
    }

    async fn interrupt(&self) -> Result<()> {
        let inner = &self.inner;
        let turn_id = lock(&inner.turn)
            .active_turn_id
            .clone()
            .ok_or_else(|| AgentError::invalid_state("no turn is running"))?;
        let thread_id = self
            .backend_session_id()
            .ok_or_else(|| AgentError::invalid_state("thread not started"))?;
        let channel = inner.channel().ok_or(AgentError::ChannelClosed)?;

        tracing::info!(session_id = %inner.id, turn_id = %turn_id, "Interrupting turn");
        channel
            .send(
                "turn/interrupt",
                json!({"threadId": thread_id, "turnId": turn_id}),
            )
            .await
            .map(|_| ())
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
            .await
    }

    async fn approve_always(&self, tool_use_id: Option<&str>) -> bool {
        self.inner
            .resolve(tool_use_id, ApprovalDecision::ApproveAlways)
            .await
    }

    async fn reject(&self, tool_use_id: Option<&str>, message: Option<String>) -> bool {
        self.inner
            .resolve(tool_use_id, ApprovalDecision::Reject { message })
            .await
    }

    async fn answer(&self, tool_use_id: &str, result: Value) -> bool {
        self.inner
            .resolve(Some(tool_use_id), ApprovalDecision::Answer(result))
            .await
    }

    fn pending_permission(&self, tool_use_id: Option<&str>) -> Option<PendingPermission> {
        self.inner.approvals.view(tool_use_id)
    }
}

impl Inner {
    fn channel(&self) -> Option<Arc<RpcChannel>> {
        lock(&self.channel).clone()
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
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

    fn thread_id(&self) -> Option<String> {
        lock(&self.thread_id).clone()
    }

    async fn run(self: Arc<Self>, channel: Arc<RpcChannel>, cwd: PathBuf, options: StartOptions) {
        let thread_id = match self.bootstrap(&channel, &cwd, &options).await {
            Ok(thread_id) => thread_id,
            Err(e) => {
                if !self.is_stopped() {
                    tracing::error!(error = %e, "Bootstrap failed");
                    self.bootstrap_failed.store(true, Ordering::SeqCst);
                    self.emitter.emit(ProviderEvent::error(format!(
                        "Failed to start session: {e}"
                    )));
                    if let Some(token) = lock(&self.shutdown).take() {
                        token.cancel();
                    }
                    self.set_status(SessionStatus::Idle);
                }
                return;
            }
        };

        tracing::info!(thread_id = %thread_id, "Thread ready");
        self.emitter.emit(ProviderEvent::System(SystemEvent {
            subtype: "init".to_string(),
            session_id: Some(thread_id.clone()),
            model: options.model.clone(),
            ..Default::default()
        }));
        self.set_status(SessionStatus::Idle);

        self.turn_loop(&channel, &thread_id).await;
        tracing::debug!("Turn loop finished");
    }

    async fn bootstrap(
        &self,
        channel: &RpcChannel,
        cwd: &Path,
        options: &StartOptions,
    ) -> Result<String> {
        channel
            .send(
                "initialize",
                json!({
                    "clientInfo": {
                        "name": "agent-hub",
                        "title": "Agent Hub",
                        "version": env!("CARGO_PKG_VERSION")
                    }
                }),
            )
            .await?;
        channel.notify("initialized", None).await?;

        let mut params = thread_params(cwd, options);
        let method = match options.resume {
            Some(ref thread_id) => {
                params["threadId"] = json!(thread_id);
                "thread/resume"
            }
            None => "thread/start",
        };
        let result = channel.send(method, params).await?;

        let thread_id = result
            .pointer("/thread/id")
            .and_then(Value::as_str)
            .map(String::from)
            .or_else(|| self.thread_id())
            .ok_or_else(|| AgentError::internal(format!("{method} returned no thread id")))?;
        *lock(&self.thread_id) = Some(thread_id.clone());
        Ok(thread_id)
    }

    async fn turn_loop(&self, channel: &RpcChannel, thread_id: &str) {
        let mut followup: Option<TurnInput> = None;
        loop {
            let input = match followup.take() {
                Some(input) => input,
                None => match self.mailbox.recv().await {
                    Some(input) => input,
                    None => break,
                },
            };

            match self.run_turn(channel, thread_id, input).await {
                Ok(next) => followup = next,
                Err(e) if e.is_intentional_stop() || self.is_stopped() => break,
                Err(AgentError::ChannelClosed) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "Turn failed");
                    self.emitter.emit(ProviderEvent::error(e.to_string()));
                    self.set_status(SessionStatus::Idle);
                }
            }
        }
    }

    /// Run one turn; returns the input of an immediate follow-up turn, if any
    async fn run_turn(
        &self,
        channel: &RpcChannel,
        thread_id: &str,
        input: TurnInput,
    ) -> Result<Option<TurnInput>> {
        let started = Instant::now();
        let image_paths = materialize_images(&self.config.image_dir, &input.images).await?;

        let mut items = vec![json!({"type": "text", "text": input.text})];
        items.extend(
            image_paths
                .iter()
                .map(|path| json!({"type": "localImage", "path": path})),
        );

        let completion = {
            let (tx, rx) = oneshot::channel();
            *lock(&self.turn) = TurnState {
                completion: Some(tx),
                ..Default::default()
            };
            rx
        };
        self.set_status(SessionStatus::Running);

        let mut params = json!({
            "threadId": thread_id,
            "input": items,
            "collaborationMode": lock(&self.mode).as_str(),
        });
        if let Some(effort) = lock(&self.effort).clone() {
            params["effort"] = json!(effort);
        }

        let accepted = match channel.send("turn/start", params).await {
            Ok(accepted) => accepted,
            Err(e) => {
                lock(&self.turn).completion = None;
                return Err(e);
            }
        };
        if let Some(turn_id) = accepted.pointer("/turn/id").and_then(Value::as_str) {
            lock(&self.turn)
                .active_turn_id
                .get_or_insert_with(|| turn_id.to_string());
        }

        let outcome = completion.await.map_err(|_| {
            if self.is_stopped() {
                AgentError::Stopped
            } else {
                AgentError::ChannelClosed
            }
        })?;

        let (plan, usage) = {
            let mut turn = lock(&self.turn);
            turn.active_turn_id = None;
            (std::mem::take(&mut turn.plan_text), turn.usage.take())
        };

        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let result = turn_result(outcome, usage, thread_id, duration_ms);
        tracing::info!(subtype = %result.subtype, duration_ms, "Turn completed");
        self.emitter.emit(ProviderEvent::Result(result));

        if *lock(&self.mode) == CollaborationMode::Plan && !plan.trim().is_empty() {
            return self.await_plan_decision(plan).await;
        }

        self.set_status(SessionStatus::Idle);
        Ok(None)
    }

    /// Surface the captured plan as an `ExitPlanMode` approval and wait
    async fn await_plan_decision(&self, plan: String) -> Result<Option<TurnInput>> {
        let tool_use_id = format!("plan-{}", uuid::Uuid::new_v4());
        let input = json!({"plan": plan});
        let (tx, rx) = oneshot::channel();

        self.approvals.insert(
            tool_use_id.clone(),
            RpcApproval {
                request_id: None,
                tool_name: PLAN_TOOL.to_string(),
                input: input.clone(),
                kind: ApprovalKind::PlanExit(tx),
            },
        );
        self.emitter.emit(ProviderEvent::permission_request(
            &tool_use_id,
            PLAN_TOOL,
            input,
        ));
        self.set_status(SessionStatus::WaitingApproval);

        let Ok(decision) = rx.await else {
            return Err(AgentError::Stopped);
        };

        match decision {
            ApprovalDecision::Approve { updated_input } => {
                let plan = updated_input
                    .as_ref()
                    .and_then(|input| input.get("plan"))
                    .and_then(Value::as_str)
                    .map_or(plan, String::from);
                Ok(Some(self.leave_plan_mode(&plan)))
            }
            ApprovalDecision::ApproveAlways => Ok(Some(self.leave_plan_mode(&plan))),
            ApprovalDecision::Reject {
                message: Some(feedback),
            } if !feedback.trim().is_empty() => Ok(Some(TurnInput::text(feedback))),
            _ => {
                self.set_status(SessionStatus::Idle);
                Ok(None)
            }
        }
    }

    fn leave_plan_mode(&self, plan: &str) -> TurnInput {
        tracing::info!("Plan approved, switching to default mode");
        *lock(&self.mode) = CollaborationMode::Default;
        TurnInput::text(format!("{PLAN_EXECUTE_PREFIX}{plan}"))
    }

    async fn resolve(&self, tool_use_id: Option<&str>, decision: ApprovalDecision) -> bool {
        let Some((id, approval)) = self.approvals.take(tool_use_id) else {
            tracing::debug!(tool_use_id = ?tool_use_id, "No pending approval to resolve");
            return false;
        };
        tracing::info!(tool_use_id = %id, tool_name = %approval.tool_name, ?decision, "Resolving approval");

        let RpcApproval {
            request_id,
            tool_name,
            input,
            kind,
        } = approval;

        if let ApprovalKind::PlanExit(tx) = kind {
            drop(tx.send(decision));
            return true;
        }

        if decision == ApprovalDecision::ApproveAlways {
            let rule = lock(&self.rules).allow_always(&tool_name, &input);
            tracing::info!(rule = %rule, "Added session allow-rule");
        }

        let payload = approval_response(&kind, &decision);
        if let (Some(request_id), Some(channel)) = (request_id, self.channel()) {
            if let Err(e) = channel.respond(&request_id, payload).await {
                tracing::warn!(tool_use_id = %id, error = %e, "Failed to answer approval request");
            }
        }

        if self.approvals.is_empty() && *lock(&self.status) == SessionStatus::WaitingApproval {
            self.set_status(SessionStatus::Running);
        }
        true
    }

    async fn route_incoming(
        self: Arc<Self>,
        channel: Arc<RpcChannel>,
        mut incoming: mpsc::UnboundedReceiver<Incoming>,
    ) {
        while let Some(message) = incoming.recv().await {
            match message {
                Incoming::Notification(notification) => self.handle_notification(&notification),
                Incoming::Request(request) => self.handle_server_request(&channel, request).await,
                Incoming::Malformed { line, error } => {
                    self.emitter.emit(ProviderEvent::warning(format!(
                        "Skipped malformed backend output ({error}): {}",
                        truncate(&line, 200)
                    )));
                }
                Incoming::Closed => break,
            }
        }
    }

    async fn handle_server_request(&self, channel: &RpcChannel, request: ServerRequest) {
        let Some((tool_name, input, kind)) = classify_server_request(&request) else {
            tracing::debug!(method = %request.method, "Acknowledging unknown server request");
            if let Err(e) = channel.respond(&request.id, json!({})).await {
                tracing::warn!(error = %e, "Failed to acknowledge server request");
            }
            return;
        };

        let tool_use_id = request
            .params
            .get("itemId")
            .and_then(Value::as_str)
            .map_or_else(|| format!("rpc-{}", id_string(&request.id)), String::from);

        if !matches!(kind, ApprovalKind::UserInput) {
            let rule = lock(&self.rules)
                .find_match(&tool_name, &input)
                .map(String::from);
            if let Some(rule) = rule {
                tracing::info!(tool_use_id = %tool_use_id, rule = %rule, "Auto-approved by session rule");
                if let Err(e) = channel
                    .respond(&request.id, json!({"decision": "accept"}))
                    .await
                {
                    tracing::warn!(error = %e, "Failed to answer approval request");
                }
                return;
            }
        }

        tracing::info!(tool_use_id = %tool_use_id, tool_name = %tool_name, "Approval requested");
        self.approvals.insert(
            tool_use_id.clone(),
            RpcApproval {
                request_id: Some(request.id),
                tool_name: tool_name.clone(),
                input: input.clone(),
                kind,
            },
        );
        self.emitter
            .emit(ProviderEvent::permission_request(tool_use_id, tool_name, input));
        self.set_status(SessionStatus::WaitingApproval);
    }

    fn handle_notification(&self, notification: &Notification) {
        let params = &notification.params;
        match notification.method.as_str() {
            "thread/started" => {
                if let Some(id) = params.pointer("/thread/id").and_then(Value::as_str) {
                    lock(&self.thread_id).get_or_insert_with(|| id.to_string());
                }
            }
            "turn/started" => {
                if let Some(id) = params.pointer("/turn/id").and_then(Value::as_str) {
                    lock(&self.turn).active_turn_id = Some(id.to_string());
                }
            }
            "turn/completed" => {
                let turn = params.get("turn").unwrap_or(params);
                let outcome = TurnOutcome {
                    status: turn
                        .get("status")
                        .and_then(Value::as_str)
                        .unwrap_or("completed")
                        .to_string(),
                    error: turn
                        .pointer("/error/message")
                        .and_then(Value::as_str)
                        .map(String::from),
                };
                match lock(&self.turn).completion.take() {
                    Some(tx) => drop(tx.send(outcome)),
                    None => tracing::debug!("turn/completed without an active turn"),
                }
            }
            "thread/tokenUsage/updated" => {
                if let Some(usage) = TokenUsage::from_rpc_usage(params) {
                    lock(&self.turn).usage = Some(usage);
                }
            }
            "item/started" => {
                if let Some(event) = params.get("item").and_then(item_started) {
                    self.emitter.emit(event);
                }
            }
            "item/completed" => {
                let Some(item) = params.get("item") else {
                    return;
                };
                if item.get("type").and_then(Value::as_str) == Some("plan") {
                    if let Some(text) = item.get("text").and_then(Value::as_str) {
                        let mut turn = lock(&self.turn);
                        turn.plan_text = text.to_string();
                        turn.plan_from_item = true;
                    }
                    return;
                }
                if let Some(event) = item_completed(item) {
                    self.emitter.emit(event);
                }
            }
            "item/agentMessage/delta" => {
                if let Some(delta) = params.get("delta").and_then(Value::as_str) {
                    self.emitter.emit(ProviderEvent::StreamDelta {
                        text: delta.to_string(),
                    });
                }
            }
            "item/reasoning/summaryTextDelta" | "item/reasoning/textDelta" => {
                if let Some(delta) = params.get("delta").and_then(Value::as_str) {
                    self.emitter.emit(ProviderEvent::ThinkingDelta {
                        text: delta.to_string(),
                    });
                }
            }
            "item/plan/delta" => {
                if let Some(delta) = params.get("delta").and_then(Value::as_str) {
                    let mut turn = lock(&self.turn);
                    if !turn.plan_from_item {
                        turn.plan_text.push_str(delta);
                    }
                }
            }
            "turn/plan/updated" => {
                let mut turn = lock(&self.turn);
                if !turn.plan_from_item {
                    if let Some(text) = format_plan_steps(params) {
                        turn.plan_text = text;
                    }
                }
            }
            "error" => {
                let message = params
                    .pointer("/error/message")
                    .or_else(|| params.get("message"))
                    .and_then(Value::as_str)
                    .unwrap_or("Unknown backend error");
                let will_retry = params
                    .get("willRetry")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                self.emitter.emit(if will_retry {
                    ProviderEvent::warning(message)
                } else {
                    ProviderEvent::error(message)
                });
            }
            other => tracing::trace!(method = %other, "Ignoring notification"),
        }
    }

    async fn watch_exit(
        self: Arc<Self>,
        channel: Arc<RpcChannel>,
        exit: BoxFuture<'static, Option<i32>>,
        router: JoinHandle<()>,
    ) {
        let code = exit.await;
        // Let buffered output reach the router before tearing down
        if tokio::time::timeout(DRAIN_GRACE, router).await.is_err() {
            tracing::debug!("Router still busy after backend exit");
        }

        let stopped = self.is_stopped();
        channel.close(if stopped {
            CloseReason::Stopped
        } else {
            CloseReason::Eof
        });
        self.mailbox.close();
        lock(&self.turn).completion = None;
        self.approvals.clear();

        if stopped {
            tracing::info!(code = ?code, "Backend stopped");
        } else if code == Some(0) {
            tracing::info!("Backend exited");
        } else if self.bootstrap_failed.load(Ordering::SeqCst) {
            tracing::debug!(code = ?code, "Backend shut down after failed bootstrap");
        } else {
            tracing::error!(code = ?code, "Backend exited unexpectedly");
            self.emitter.emit(ProviderEvent::error(format!(
                "Backend process exited unexpectedly (code: {})",
                code.map_or_else(|| "signal".to_string(), |c| c.to_string())
            )));
        }
        self.set_status(SessionStatus::Idle);
        self.emitter.exit(code);
    }
}

fn thread_params(cwd: &Path, options: &StartOptions) -> Value {
    let mut params = json!({"cwd": cwd.to_string_lossy()});
    if let Some(ref model) = options.model {
        params["model"] = json!(model);
    }
    if let Some(ref policy) = options.permission_mode {
        params["approvalPolicy"] = json!(policy);
    }
    if let Some(ref sandbox) = options.sandbox_mode {
        params["sandbox"] = json!(sandbox);
    }
    if let Some(ref append) = options.system_prompt_append {
        params["developerInstructions"] = json!(append);
    }

    let mut config = Map::new();
    if let Some(network) = options.network_access {
        config.insert(
            "sandbox_workspace_write.network_access".to_string(),
            json!(network),
        );
    }
    if let Some(web_search) = options.web_search {
        config.insert("tools.web_search".to_string(), json!(web_search));
    }
    if !config.is_empty() {
        params["config"] = Value::Object(config);
    }
    params
}

fn turn_result(
    outcome: TurnOutcome,
    usage: Option<TokenUsage>,
    thread_id: &str,
    duration_ms: u64,
) -> ResultEvent {
    let base = ResultEvent {
        session_id: Some(thread_id.to_string()),
        duration_ms: Some(duration_ms),
        ..Default::default()
    };
    match outcome.status.as_str() {
        "failed" => ResultEvent {
            subtype: "error".to_string(),
            error: Some(
                outcome
                    .error
                    .unwrap_or_else(|| "Turn failed".to_string()),
            ),
            ..base
        },
        "interrupted" => ResultEvent {
            subtype: "interrupted".to_string(),
            ..base
        },
        _ => ResultEvent {
            subtype: "success".to_string(),
            token_usage: usage,
            ..base
        },
    }
}

fn classify_server_request(request: &ServerRequest) -> Option<(String, Value, ApprovalKind)> {
    let params = &request.params;
    match request.method.as_str() {
        "item/commandExecution/requestApproval" => {
            let mut input = Map::new();
            input.insert("command".to_string(), json!(command_string(params)));
            for key in ["cwd", "reason"] {
                if let Some(value) = params.get(key).filter(|v| !v.is_null()) {
                    input.insert(key.to_string(), value.clone());
                }
            }
            Some(("Bash".to_string(), Value::Object(input), ApprovalKind::Command))
        }
        "item/fileChange/requestApproval" => {
            Some(("Edit".to_string(), params.clone(), ApprovalKind::FileChange))
        }
        "item/tool/requestUserInput" => Some((
            USER_INPUT_TOOL.to_string(),
            json!({"questions": params.get("questions").cloned().unwrap_or_else(|| json!([]))}),
            ApprovalKind::UserInput,
        )),
        _ => None,
    }
}

fn command_string(value: &Value) -> String {
    match value.get("command") {
        Some(Value::String(command)) => command.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join(" "),
        _ => String::new(),
    }
}

fn approval_response(kind: &ApprovalKind, decision: &ApprovalDecision) -> Value {
    match kind {
        ApprovalKind::UserInput => {
            let answers = match decision {
                ApprovalDecision::Answer(answers)
                | ApprovalDecision::Approve {
                    updated_input: Some(answers),
                } => normalize_answers(answers),
                _ => Map::new(),
            };
            json!({"answers": answers})
        }
        _ => {
            let decision = match decision {
                ApprovalDecision::ApproveAlways => "acceptForSession",
                ApprovalDecision::Approve { .. } | ApprovalDecision::Answer(_) => "accept",
                ApprovalDecision::Reject { .. } | ApprovalDecision::TimedOut => "decline",
            };
            json!({"decision": decision})
        }
    }
}

/// Normalize caller answers into `{questionId: {"answers": [..]}}`
fn normalize_answers(value: &Value) -> Map<String, Value> {
    let answers = value.get("answers").unwrap_or(value);
    let Some(answers) = answers.as_object() else {
        return Map::new();
    };

    answers
        .iter()
        .map(|(question_id, answer)| {
            let list = match answer {
                Value::String(text) => vec![json!(text)],
                Value::Array(items) => items.clone(),
                Value::Object(object) => match object.get("answers") {
                    Some(Value::Array(items)) => items.clone(),
                    Some(other) => vec![other.clone()],
                    None => vec![answer.clone()],
                },
                Value::Null => Vec::new(),
                other => vec![json!(other.to_string())],
            };
            (question_id.clone(), json!({"answers": list}))
        })
        .collect()
}

fn item_started(item: &Value) -> Option<ProviderEvent> {
    let id = item.get("id").and_then(Value::as_str)?;
    let (name, input) = match item.get("type").and_then(Value::as_str)? {
        "commandExecution" => ("Bash".to_string(), json!({"command": command_string(item)})),
        "fileChange" => (
            "Edit".to_string(),
            json!({"changes": item.get("changes").cloned().unwrap_or_else(|| json!([]))}),
        ),
        "mcpToolCall" => {
            let server = item.get("server").and_then(Value::as_str).unwrap_or("mcp");
            let tool = item.get("tool").and_then(Value::as_str).unwrap_or("tool");
            (
                format!("mcp__{server}__{tool}"),
                item.get("arguments").cloned().unwrap_or_else(|| json!({})),
            )
        }
        "webSearch" => (
            "WebSearch".to_string(),
            json!({"query": item.get("query").cloned().unwrap_or(Value::Null)}),
        ),
        _ => return None,
    };
    Some(ProviderEvent::Assistant(AssistantEvent::tool_use(
        id, name, input,
    )))
}

fn item_completed(item: &Value) -> Option<ProviderEvent> {
    let item_type = item.get("type").and_then(Value::as_str)?;
    if item_type == "agentMessage" {
        let text = item.get("text").and_then(Value::as_str)?;
        if text.is_empty() {
            return None;
        }
        return Some(ProviderEvent::Assistant(AssistantEvent::text(text)));
    }

    let id = item.get("id").and_then(Value::as_str)?;
    let failed = matches!(
        item.get("status").and_then(Value::as_str),
        Some("failed" | "declined")
    );
    let (tool_name, content, is_error) = match item_type {
        "commandExecution" => {
            let exit_code = item.get("exitCode").and_then(Value::as_i64);
            (
                "Bash",
                item.get("aggregatedOutput")
                    .cloned()
                    .unwrap_or_else(|| json!("")),
                failed || exit_code.is_some_and(|code| code != 0),
            )
        }
        "fileChange" => {
            let summary = item
                .get("changes")
                .and_then(Value::as_array)
                .map(|changes| {
                    changes
                        .iter()
                        .filter_map(|change| {
                            let path = change.get("path").and_then(Value::as_str)?;
                            let kind = change
                                .pointer("/kind/type")
                                .or_else(|| change.get("kind"))
                                .and_then(Value::as_str)
                                .unwrap_or("update");
                            Some(format!("{kind}: {path}"))
                        })
                        .collect::<Vec<_>>()
                        .join("\n")
                })
                .unwrap_or_default();
            ("Edit", json!(summary), failed)
        }
        "mcpToolCall" => {
            let error = item.pointer("/error/message").cloned();
            let content = error.clone().unwrap_or_else(|| {
                item.pointer("/result/content")
                    .or_else(|| item.get("result"))
                    .cloned()
                    .unwrap_or(Value::Null)
            });
            ("", content, failed || error.is_some())
        }
        "webSearch" => (
            "WebSearch",
            item.get("query").cloned().unwrap_or(Value::Null),
            failed,
        ),
        _ => return None,
    };

    Some(ProviderEvent::ToolResult(ToolResultEvent {
        tool_use_id: id.to_string(),
        content,
        tool_name: (!tool_name.is_empty()).then(|| tool_name.to_string()),
        is_error,
        ..Default::default()
    }))
}

fn format_plan_steps(params: &Value) -> Option<String> {
    let steps = params.get("plan").and_then(Value::as_array)?;
    let mut lines: Vec<String> = params
        .get("explanation")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(|s| vec![s.to_string()])
        .unwrap_or_default();
    lines.extend(steps.iter().filter_map(|step| {
        let text = step.get("step").and_then(Value::as_str)?;
        Some(format!("- {text}"))
    }));
    (!lines.is_empty()).then(|| lines.join("\n"))
}

fn id_string(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let mut out: String = s.chars().take(max_chars).collect();
        out.push_str("...");
        out
    }
}
