//! Error types for client operations.

use serde_json::Value;
use thiserror::Error;

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors surfaced by [`crate::McpClient`].
#[derive(Error, Debug)]
pub enum ClientError {
    /// Transport-level errors
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// The server answered with a JSON-RPC error object
    #[error("Server error (code {code}): {message}")]
    Rpc {
        code: i64,
        message: String,
        data: Option<Value>,
    },

    /// Handshake failed or produced an unusable result
    #[error("Initialize failed: {0}")]
    Initialize(String),

    /// Operation attempted before `connect()` completed
    #[error("Client not connected")]
    NotConnected,

    /// The per-request deadline elapsed
    #[error("Request timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// JSON (de)serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ClientError {
    /// Build an error from a JSON-RPC error object.
    pub fn rpc(error: onemcp_protocol::ErrorObject) -> Self {
        Self::Rpc {
            code: error.code,
            message: error.message,
            data: error.data,
        }
    }

    /// Whether retrying the same request could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(TransportError::ConnectionFailed(_)) => true,
            Self::Transport(TransportError::Closed) => true,
            Self::Timeout(_) => true,
            Self::Rpc { code, .. } => matches!(code, -32099..=-32000),
            _ => false,
        }
    }
}

/// Transport-specific errors.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Stdio transport error: {0}")]
    Stdio(String),

    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP status {0}")]
    HttpStatus(u16),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Unsupported transport: {0}")]
    Unsupported(String),

    #[error("Transport closed unexpectedly")]
    Closed,

    #[error("Transport not started")]
    NotStarted,
}
