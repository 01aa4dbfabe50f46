//! Gateway error types.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::template::{PoolError, TemplateError};

/// Result type for gateway operations.
pub type ProxyResult<T> = Result<T, ProxyError>;

/// Errors raised inside the gateway core.
///
/// These never cross the inbound MCP boundary as-is: the dispatch layer maps
/// them to JSON-RPC error objects, and the meta-tools fold them into
/// structured response fields.
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Upstream client error: {0}")]
    Client(#[from] onemcp_client::ClientError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] onemcp_protocol::McpError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Template error: {0}")]
    Template(#[from] TemplateError),

    #[error("Instance pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Unknown connection: {0}")]
    UnknownConnection(String),

    #[error("Connection '{0}' is not connected")]
    NotConnected(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ProxyError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Map into a protocol-level error object for the inbound boundary.
    pub fn to_error_object(&self) -> onemcp_protocol::ErrorObject {
        match self {
            ProxyError::Protocol(e) => e.to_error_object(),
            ProxyError::UnknownConnection(_) | ProxyError::NotConnected(_) => {
                onemcp_protocol::ErrorObject::new(
                    onemcp_protocol::json_rpc::INVALID_PARAMS,
                    self.to_string(),
                )
            }
            _ => onemcp_protocol::ErrorObject::new(
                onemcp_protocol::json_rpc::INTERNAL_ERROR,
                self.to_string(),
            ),
        }
    }
}

/// Classification of meta-tool failures, surfaced as a structured field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetaToolErrorKind {
    Validation,
    NotFound,
    Upstream,
    Internal,
}

/// Structured error payload returned inside meta-tool responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaToolError {
    #[serde(rename = "type")]
    pub kind: MetaToolErrorKind,
    pub message: String,
}

impl MetaToolError {
    pub fn new(kind: MetaToolErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(MetaToolErrorKind::Validation, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(MetaToolErrorKind::NotFound, message)
    }

    pub fn upstream(message: impl Into<String>) -> Self {
        Self::new(MetaToolErrorKind::Upstream, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(MetaToolErrorKind::Internal, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_tool_error_wire_format() {
        let error = MetaToolError::not_found("Tool not found: db:query");
        let value = serde_json::to_value(&error).unwrap();
        assert_eq!(value["type"], "not_found");
        assert_eq!(value["message"], "Tool not found: db:query");
    }
}
