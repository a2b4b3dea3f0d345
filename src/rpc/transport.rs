//! Byte transports for the JSON-RPC backend
//!
//! [`StdioTransport`] spawns the app-server and wires its stdio. Tests plug in
//! in-memory pipes through the same [`RpcTransport`] seam.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::types::{AgentError, Result};

/// A connected backend
pub struct TransportIo {
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
    /// Resolves with the exit code once the backend is gone
    pub exit: BoxFuture<'static, Option<i32>>,
    /// Cancel to terminate the backend
    pub shutdown: CancellationToken,
}

impl std::fmt::Debug for TransportIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportIo").finish_non_exhaustive()
    }
}

/// Opens a connection to a JSON-RPC backend
#[async_trait]
pub trait RpcTransport: Send + Sync + std::fmt::Debug {
    async fn connect(&self, cwd: &Path) -> Result<TransportIo>;
}

/// Spawns the app-server binary and talks over its stdio
#[derive(Debug, Clone)]
pub struct StdioTransport {
    program: String,
    args: Vec<String>,
}

impl StdioTransport {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: vec!["app-server".to_string()],
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }
}

#[async_trait]
impl RpcTransport for StdioTransport {
    async fn connect(&self, cwd: &Path) -> Result<TransportIo> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .current_dir(cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| AgentError::spawn_failed(&self.program, e))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AgentError::spawn_failed(&self.program, "stdin not captured"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AgentError::spawn_failed(&self.program, "stdout not captured"))?;

        if let Some(stderr) = child.stderr.take() {
            let span = tracing::debug_span!("backend_stderr", program = %self.program);
            tokio::spawn(
                async move {
                    let mut lines = BufReader::new(stderr).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        tracing::debug!(line = %line, "backend stderr");
                    }
                }
                .instrument(span),
            );
        }

        tracing::info!(
            program = %self.program,
            pid = ?child.id(),
            cwd = %cwd.display(),
            "Spawned JSON-RPC backend"
        );

        let shutdown = CancellationToken::new();
        let (exit_tx, exit_rx) = tokio::sync::oneshot::channel();
        let token = shutdown.clone();
        tokio::spawn(async move {
            let code = tokio::select! {
                status = child.wait() => status.ok().and_then(|s| s.code()),
                () = token.cancelled() => {
                    if let Err(e) = child.kill().await {
                        tracing::warn!(error = %e, "Failed to kill backend process");
                    }
                    child.wait().await.ok().and_then(|s| s.code())
                }
            };
            drop(exit_tx.send(code));
        });

        Ok(TransportIo {
            reader: Box::new(stdout),
            writer: Box::new(stdin),
            exit: Box::pin(async move { exit_rx.await.ok().flatten() }),
            shutdown,
        })
    }
}
