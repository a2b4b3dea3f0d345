//! Error types for the agent hub

use thiserror::Error;

/// Error codes surfaced to transports
///
/// Standard JSON-RPC error codes plus hub-specific codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    // Standard JSON-RPC errors (-32xxx)
    /// Parse error: Invalid JSON
    ParseError = -32700,
    /// Invalid request: Not a valid request object
    InvalidRequest = -32600,
    /// Method not found
    MethodNotFound = -32601,
    /// Invalid params
    InvalidParams = -32602,
    /// Internal error
    InternalError = -32603,

    // Hub-specific errors (-32000 to -32099)
    /// Session not found
    SessionNotFound = -32001,
    /// Operation not supported by this backend
    Unsupported = -32002,
    /// Backend process could not be spawned or has exited
    ProcessFailed = -32003,
    /// Backend rejected an RPC call
    BackendError = -32004,
    /// RPC call timed out
    Timeout = -32005,
    /// Session was stopped
    Stopped = -32006,
    /// Session is not in a state that accepts the operation
    InvalidState = -32007,
    /// Configuration error
    ConfigError = -32010,
}

impl ErrorCode {
    /// Get the error code value
    pub fn code(self) -> i32 {
        self as i32
    }
}

/// Main error type for the agent hub
#[derive(Debug, Error)]
pub enum AgentError {
    // === Session errors ===
    /// Session not found
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Operation not supported by the backend
    #[error("{operation} is not supported by the {backend} backend")]
    Unsupported {
        backend: &'static str,
        operation: &'static str,
    },

    /// Session is not in a state that accepts the operation
    #[error("Invalid session state: {0}")]
    InvalidState(String),

    /// Session was stopped intentionally
    #[error("Session stopped")]
    Stopped,

    // === Process errors ===
    /// Backend process could not be spawned
    #[error("Failed to spawn {command}: {error}")]
    SpawnFailed { command: String, error: String },

    /// Backend process exited
    #[error("Backend process exited (code: {code:?})")]
    ProcessExited { code: Option<i32> },

    // === RPC errors ===
    /// The backend answered with an `error` object
    #[error("RPC error {code}: {message}")]
    Rpc {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// No response arrived within the configured timeout
    #[error("RPC call {method} timed out after {timeout_ms}ms")]
    RpcTimeout { method: String, timeout_ms: u64 },

    /// The channel is closed and can no longer carry messages
    #[error("RPC channel closed")]
    ChannelClosed,

    // === Configuration errors ===
    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    // === External errors ===
    /// Claude SDK error
    #[error("Claude SDK error: {0}")]
    ClaudeSdk(#[from] claude_code_agent_sdk::ClaudeError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // === Generic errors ===
    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for the agent hub
pub type Result<T> = std::result::Result<T, AgentError>;

impl AgentError {
    /// Get the error code for this error
    pub fn error_code(&self) -> ErrorCode {
        match self {
            AgentError::SessionNotFound(_) => ErrorCode::SessionNotFound,
            AgentError::Unsupported { .. } => ErrorCode::Unsupported,
            AgentError::InvalidState(_) => ErrorCode::InvalidState,
            AgentError::Stopped => ErrorCode::Stopped,
            AgentError::SpawnFailed { .. } => ErrorCode::ProcessFailed,
            AgentError::ProcessExited { .. } => ErrorCode::ProcessFailed,
            AgentError::Rpc { .. } => ErrorCode::BackendError,
            AgentError::RpcTimeout { .. } => ErrorCode::Timeout,
            AgentError::ChannelClosed => ErrorCode::ProcessFailed,
            AgentError::ConfigError(_) => ErrorCode::ConfigError,
            AgentError::ClaudeSdk(_) => ErrorCode::InternalError,
            AgentError::Io(_) => ErrorCode::InternalError,
            AgentError::Json(_) => ErrorCode::ParseError,
            AgentError::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, AgentError::RpcTimeout { .. })
    }

    /// Check if this error is a client error (caused by invalid input)
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            AgentError::SessionNotFound(_)
                | AgentError::Unsupported { .. }
                | AgentError::InvalidState(_)
        )
    }

    /// Check if this error comes from an intentional stop.
    ///
    /// These are never surfaced as `error` events.
    pub fn is_intentional_stop(&self) -> bool {
        matches!(self, AgentError::Stopped)
    }

    // === Constructor helpers ===

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        AgentError::Internal(msg.into())
    }

    /// Create a session not found error
    pub fn session_not_found(session_id: impl Into<String>) -> Self {
        AgentError::SessionNotFound(session_id.into())
    }

    /// Create an invalid state error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        AgentError::InvalidState(msg.into())
    }

    /// Create a spawn failure error
    pub fn spawn_failed(command: impl Into<String>, error: impl std::fmt::Display) -> Self {
        AgentError::SpawnFailed {
            command: command.into(),
            error: error.to_string(),
        }
    }

    /// Create a configuration error
    pub fn config_error(msg: impl Into<String>) -> Self {
        AgentError::ConfigError(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AgentError::session_not_found("test-123");
        assert_eq!(err.to_string(), "Session not found: test-123");

        let err = AgentError::Unsupported {
            backend: "codex",
            operation: "rewind",
        };
        assert_eq!(err.to_string(), "rewind is not supported by the codex backend");

        let err = AgentError::RpcTimeout {
            method: "turn/start".to_string(),
            timeout_ms: 500,
        };
        assert_eq!(err.to_string(), "RPC call turn/start timed out after 500ms");
    }

    #[test]
    fn test_error_codes() {
        let err = AgentError::session_not_found("test");
        assert_eq!(err.error_code(), ErrorCode::SessionNotFound);
        assert_eq!(err.error_code().code(), -32001);

        let err = AgentError::Stopped;
        assert_eq!(err.error_code(), ErrorCode::Stopped);

        let err = AgentError::Rpc {
            code: -1,
            message: "nope".to_string(),
            data: None,
        };
        assert_eq!(err.error_code(), ErrorCode::BackendError);
    }

    #[test]
    fn test_is_retryable() {
        assert!(
            AgentError::RpcTimeout {
                method: "x".to_string(),
                timeout_ms: 1
            }
            .is_retryable()
        );
        assert!(!AgentError::session_not_found("x").is_retryable());
        assert!(!AgentError::Stopped.is_retryable());
    }

    #[test]
    fn test_is_client_error() {
        assert!(AgentError::session_not_found("x").is_client_error());
        assert!(AgentError::invalid_state("busy").is_client_error());
        assert!(!AgentError::ChannelClosed.is_client_error());
        assert!(!AgentError::internal("oops").is_client_error());
    }

    #[test]
    fn test_intentional_stop() {
        assert!(AgentError::Stopped.is_intentional_stop());
        assert!(!AgentError::ProcessExited { code: Some(1) }.is_intentional_stop());
    }

    #[test]
    fn test_spawn_failed_helper() {
        let err = AgentError::spawn_failed("codex", "No such file or directory");
        assert_eq!(err.to_string(), "Failed to spawn codex: No such file or directory");
        assert_eq!(err.error_code(), ErrorCode::ProcessFailed);
    }
}
