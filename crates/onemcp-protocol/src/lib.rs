//! # MCP protocol types for the 1MCP gateway
//!
//! Wire-level types for the Model Context Protocol as the gateway speaks it
//! on both sides: the JSON-RPC envelope, the initialize handshake, and the
//! tool/resource/prompt/completion verb payloads.
//!
//! The gateway is deliberately agnostic about payload internals it merely
//! forwards (tool arguments, resource bodies); those stay `serde_json::Value`.
//! Everything it inspects or rewrites (names, URIs, cursors, capabilities)
//! is typed here.

pub mod completion;
pub mod content;
pub mod initialize;
pub mod json_rpc;
pub mod methods;
pub mod notifications;
pub mod ping;
pub mod prelude;
pub mod prompts;
pub mod resources;
pub mod tools;
pub mod version;

pub use completion::{
    CompleteParams, CompleteRequestArgument, CompleteResult, CompletionReference,
    CompletionValues, PromptReference, ResourceTemplateReference,
};
pub use content::ContentBlock;
pub use initialize::{
    ClientCapabilities, Implementation, InitializeParams, InitializeResult,
    ListChangedCapability, ResourcesCapability, ServerCapabilities,
};
pub use json_rpc::{
    ErrorObject, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
    JsonRpcVersion, RequestId,
};
pub use ping::EmptyResult;
pub use prompts::{
    GetPromptParams, GetPromptResult, ListPromptsParams, ListPromptsResult, Prompt,
    PromptArgument, PromptMessage,
};
pub use resources::{
    ListResourceTemplatesParams, ListResourceTemplatesResult, ListResourcesParams,
    ListResourcesResult, ReadResourceParams, ReadResourceResult, Resource, ResourceContents,
    ResourceTemplate, SubscribeParams, UnsubscribeParams,
};
pub use tools::{
    CallToolParams, CallToolResult, ListToolsParams, ListToolsResult, Tool, ToolAnnotations,
    ToolSchema,
};
pub use version::MCP_VERSION;

/// Common result type for MCP operations.
pub type McpResult<T> = Result<T, McpError>;

/// Protocol-level errors.
///
/// Every variant maps onto a JSON-RPC error object via [`McpError::to_error_object`],
/// so handlers can bubble these with `?` and the dispatch layer produces a
/// well-formed error response at the boundary.
#[derive(Debug, thiserror::Error)]
pub enum McpError {
    #[error("Method not found: {0}")]
    MethodNotFound(String),

    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    #[error("Prompt not found: {0}")]
    PromptNotFound(String),

    #[error("Server not found: {0}")]
    ServerNotFound(String),

    #[error("Capability not supported: {0}")]
    CapabilityNotSupported(String),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl McpError {
    /// Create an invalid-params error with a formatted message.
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::InvalidParams(message.into())
    }

    /// Create an internal error with a formatted message.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// JSON-RPC error code for this error.
    pub fn code(&self) -> i64 {
        match self {
            Self::MethodNotFound(_) => json_rpc::METHOD_NOT_FOUND,
            Self::InvalidParams(_) => json_rpc::INVALID_PARAMS,
            Self::Serialization(_) => json_rpc::PARSE_ERROR,
            Self::ToolNotFound(_)
            | Self::ResourceNotFound(_)
            | Self::PromptNotFound(_)
            | Self::ServerNotFound(_) => json_rpc::INVALID_PARAMS,
            _ => json_rpc::INTERNAL_ERROR,
        }
    }

    /// Convert into a JSON-RPC error object for the wire.
    pub fn to_error_object(&self) -> ErrorObject {
        ErrorObject::new(self.code(), self.to_string())
    }
}
