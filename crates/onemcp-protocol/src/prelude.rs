//! Convenience re-exports for protocol consumers.

pub use crate::completion::{CompleteParams, CompleteResult, CompletionReference};
pub use crate::content::ContentBlock;
pub use crate::initialize::{
    ClientCapabilities, Implementation, InitializeParams, InitializeResult, ServerCapabilities,
};
pub use crate::json_rpc::{
    ErrorObject, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, RequestId,
};
pub use crate::methods;
pub use crate::ping::EmptyResult;
pub use crate::prompts::{GetPromptParams, GetPromptResult, ListPromptsResult, Prompt};
pub use crate::resources::{
    ListResourceTemplatesResult, ListResourcesResult, ReadResourceResult, Resource,
    ResourceContents, ResourceTemplate,
};
pub use crate::tools::{CallToolParams, CallToolResult, ListToolsResult, Tool, ToolSchema};
pub use crate::version::MCP_VERSION;
pub use crate::{McpError, McpResult};
