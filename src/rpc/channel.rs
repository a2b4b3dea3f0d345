//! Id-correlated JSON-RPC channel over a pair of byte streams
//!
//! Requests get monotonically increasing integer ids. A pending table maps
//! each id to a one-shot resolver; the reader task fires the resolver for a
//! response exactly once and removes the entry. Responses with unknown ids are
//! dropped. Server requests, notifications and malformed lines are handed to
//! the owner through an ordered incoming queue.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::types::{AgentError, Result};

use super::message::{
    Notification, OutgoingNotification, OutgoingRequest, OutgoingResponse, ParseLineError,
    Response, RpcErrorObject, RpcMessage, ServerRequest,
};

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type CallOutcome = std::result::Result<Value, AgentError>;

/// Message delivered to the channel owner, in wire order
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Request(ServerRequest),
    Notification(Notification),
    /// A line that could not be parsed; the channel stays open
    Malformed { line: String, error: ParseLineError },
    /// The read side reached end of stream
    Closed,
}

/// Why outstanding calls are being rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The backend closed its output
    Eof,
    /// The owner stopped the session
    Stopped,
}

impl CloseReason {
    fn to_error(self) -> AgentError {
        match self {
            Self::Eof => AgentError::ChannelClosed,
            Self::Stopped => AgentError::Stopped,
        }
    }
}

#[derive(Debug)]
struct PendingCall {
    method: String,
    tx: oneshot::Sender<CallOutcome>,
}

/// Newline-delimited JSON-RPC channel
pub struct RpcChannel {
    writer: Mutex<BoxedWriter>,
    pending: DashMap<u64, PendingCall>,
    next_id: AtomicU64,
    timeout: Option<Duration>,
    closed: AtomicBool,
}

impl std::fmt::Debug for RpcChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcChannel")
            .field("pending", &self.pending.len())
            .field("next_id", &self.next_id.load(Ordering::Relaxed))
            .field("timeout", &self.timeout)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl RpcChannel {
    /// Wrap a reader/writer pair and start the reader task
    ///
    /// `timeout` bounds how long a call may stay pending (`None` = unbounded).
    pub fn spawn<R, W>(
        reader: R,
        writer: W,
        timeout: Option<Duration>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Incoming>, JoinHandle<()>)
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let channel = Arc::new(Self {
            writer: Mutex::new(Box::new(writer)),
            pending: DashMap::new(),
            next_id: AtomicU64::new(1),
            timeout,
            closed: AtomicBool::new(false),
        });
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();

        let span = tracing::debug_span!("rpc_reader");
        let handle = tokio::spawn(
            read_loop(Arc::downgrade(&channel), reader, incoming_tx).instrument(span),
        );

        (channel, incoming_rx, handle)
    }

    /// Send a request and wait for its response
    pub async fn send(&self, method: &str, params: Value) -> Result<Value> {
        if self.is_closed() {
            return Err(AgentError::ChannelClosed);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            id,
            PendingCall {
                method: method.to_string(),
                tx,
            },
        );

        tracing::debug!(id, method = %method, "Sending RPC request");
        if let Err(e) = self
            .write_line(&OutgoingRequest { id, method, params })
            .await
        {
            self.pending.remove(&id);
            return Err(e);
        }

        let outcome = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    self.pending.remove(&id);
                    tracing::warn!(id, method = %method, "RPC request timed out");
                    return Err(AgentError::RpcTimeout {
                        method: method.to_string(),
                        timeout_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                    });
                }
            },
            None => rx.await,
        };

        outcome.unwrap_or(Err(AgentError::ChannelClosed))
    }

    /// Fire-and-forget notification
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        if self.is_closed() {
            return Err(AgentError::ChannelClosed);
        }
        self.write_line(&OutgoingNotification { method, params })
            .await
    }

    /// Answer a server-initiated request
    pub async fn respond(&self, id: &Value, result: Value) -> Result<()> {
        self.write_line(&OutgoingResponse {
            id,
            result: Some(result),
            error: None,
        })
        .await
    }

    /// Answer a server-initiated request with an error
    pub async fn respond_error(&self, id: &Value, code: i64, message: &str) -> Result<()> {
        self.write_line(&OutgoingResponse {
            id,
            result: None,
            error: Some(RpcErrorObject {
                code,
                message: message.to_string(),
                data: None,
            }),
        })
        .await
    }

    /// Reject every outstanding call and refuse new ones
    pub fn close(&self, reason: CloseReason) {
        self.closed.store(true, Ordering::SeqCst);

        let ids: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, call)) = self.pending.remove(&id) {
                tracing::debug!(id, method = %call.method, ?reason, "Rejecting pending RPC call");
                drop(call.tx.send(Err(reason.to_error())));
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of calls waiting for a response
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    async fn write_line<T: Serialize>(&self, message: &T) -> Result<()> {
        let mut line = serde_json::to_string(message)?;
        line.push('\n');

        let mut writer = self.writer.lock().await;
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }

    fn resolve(&self, response: Response) {
        let Some(id) = response.id.as_u64() else {
            tracing::debug!(id = %response.id, "Dropping response with non-integer id");
            return;
        };

        let Some((_, call)) = self.pending.remove(&id) else {
            tracing::debug!(id, "Dropping unmatched RPC response");
            return;
        };

        let outcome = response.outcome.map_err(|error| AgentError::Rpc {
            code: error.code,
            message: error.message,
            data: error.data,
        });
        if let Err(ref e) = outcome {
            tracing::debug!(id, method = %call.method, error = %e, "RPC call failed");
        }
        drop(call.tx.send(outcome));
    }
}

async fn read_loop<R>(
    channel: Weak<RpcChannel>,
    reader: R,
    incoming: mpsc::UnboundedSender<Incoming>,
) where
    R: AsyncRead + Send + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read from RPC stream");
                break;
            }
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let Some(channel) = channel.upgrade() else {
            return;
        };

        match RpcMessage::parse(trimmed) {
            Ok(RpcMessage::Response(response)) => channel.resolve(response),
            Ok(RpcMessage::Request(request)) => {
                drop(incoming.send(Incoming::Request(request)));
            }
            Ok(RpcMessage::Notification(notification)) => {
                drop(incoming.send(Incoming::Notification(notification)));
            }
            Err(error) => {
                tracing::warn!(error = %error, "Skipping malformed RPC line");
                drop(incoming.send(Incoming::Malformed {
                    line: trimmed.to_string(),
                    error,
                }));
            }
        }
    }

    if let Some(channel) = channel.upgrade() {
        channel.close(CloseReason::Eof);
    }
    drop(incoming.send(Incoming::Closed));
}
