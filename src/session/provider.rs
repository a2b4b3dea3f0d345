//! The uniform provider session contract
//!
//! Both backend families implement [`ProviderSession`]. The manager only ever
//! sees `Arc<dyn ProviderSession>` plus the session's outbound event queue.

use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::types::{
    BackendKind, ImageAttachment, ProviderEvent, Result, SessionEvent, SessionStatus,
    StartOptions,
};

use super::approvals::PendingPermission;

/// Sending half of a session's ordered outbound queue
pub type EventSender = mpsc::UnboundedSender<SessionEvent>;
/// Receiving half of a session's ordered outbound queue, drained by the manager
pub type EventReceiver = mpsc::UnboundedReceiver<SessionEvent>;

/// Create an outbound event queue
pub fn event_channel() -> (EventEmitter, EventReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventEmitter { tx }, rx)
}

/// Thin wrapper over the outbound queue
///
/// Emission never fails: once the manager dropped the receiver there is
/// nobody left to tell.
#[derive(Debug, Clone)]
pub struct EventEmitter {
    tx: EventSender,
}

impl EventEmitter {
    pub fn emit(&self, event: ProviderEvent) {
        drop(self.tx.send(SessionEvent::Message(event)));
    }

    pub fn status(&self, status: SessionStatus) {
        self.emit(ProviderEvent::status(status));
    }

    pub fn exit(&self, code: Option<i32>) {
        drop(self.tx.send(SessionEvent::Exit { code }));
    }
}

/// One queued caller input
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TurnInput {
    pub text: String,
    pub images: Vec<ImageAttachment>,
}

impl TurnInput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            images: Vec::new(),
        }
    }
}

/// Control surface shared by every backend
#[async_trait]
pub trait ProviderSession: Send + Sync + fmt::Debug {
    /// Hub-assigned session id
    fn id(&self) -> &str;

    fn backend(&self) -> BackendKind;

    fn status(&self) -> SessionStatus;

    /// Backend-assigned thread/session id, once known
    fn backend_session_id(&self) -> Option<String>;

    /// Spawn or connect the backend and enter the turn loop
    ///
    /// Returns once the session task is running; bootstrap failures surface
    /// as `error` + exit events.
    async fn start(&self, cwd: PathBuf, options: StartOptions) -> Result<()>;

    /// Tear down the backend; outstanding approvals are abandoned
    async fn stop(&self);

    /// Interrupt the running turn
    async fn interrupt(&self) -> Result<()>;

    fn send_input(&self, text: String) {
        self.send_input_with_images(text, Vec::new());
    }

    fn send_input_with_images(&self, text: String, images: Vec<ImageAttachment>);

    /// Returns false when no matching approval was pending
    async fn approve(&self, tool_use_id: Option<&str>, updated_input: Option<Value>) -> bool;

    async fn approve_always(&self, tool_use_id: Option<&str>) -> bool;

    async fn reject(&self, tool_use_id: Option<&str>, message: Option<String>) -> bool;

    async fn answer(&self, tool_use_id: &str, result: Value) -> bool;

    fn pending_permission(&self, tool_use_id: Option<&str>) -> Option<PendingPermission>;

    /// Whether the backend can resume at an earlier message
    fn supports_rewind(&self) -> bool {
        false
    }
}
