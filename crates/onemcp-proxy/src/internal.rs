//! The reserved `1mcp` connection: internal tools provider seam.
//!
//! Management tooling plugs in behind [`InternalToolProvider`]; the gateway
//! core only routes to it. The default provider exposes nothing.

use async_trait::async_trait;
use serde_json::Value;

use onemcp_protocol::{CallToolResult, McpError, McpResult, Tool};

/// Provider behind the reserved `1mcp` connection name.
#[async_trait]
pub trait InternalToolProvider: Send + Sync {
    /// Tools to expose under the `1mcp` prefix.
    fn list_tools(&self) -> Vec<Tool>;

    /// Invoke one of the provider's tools by bare name.
    async fn call_tool(&self, name: &str, arguments: Option<Value>) -> McpResult<CallToolResult>;
}

/// Default provider with an empty catalogue.
pub struct EmptyInternalTools;

#[async_trait]
impl InternalToolProvider for EmptyInternalTools {
    fn list_tools(&self) -> Vec<Tool> {
        Vec::new()
    }

    async fn call_tool(&self, name: &str, _arguments: Option<Value>) -> McpResult<CallToolResult> {
        Err(McpError::ToolNotFound(name.to_string()))
    }
}
