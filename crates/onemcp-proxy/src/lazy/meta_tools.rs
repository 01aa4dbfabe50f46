//! The three meta-tools and their response shapes.
//!
//! `tool_list`, `tool_schema` and `tool_invoke` are the whole tool surface a
//! lazy-mode session sees. Responses carry a structured `error` field
//! instead of ever throwing across the MCP boundary.

use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;

use onemcp_protocol::{CallToolResult, Tool, ToolSchema};

use crate::error::MetaToolError;
use crate::lazy::registry::ToolMetadata;

pub const META_TOOL_LIST: &str = "tool_list";
pub const META_TOOL_SCHEMA: &str = "tool_schema";
pub const META_TOOL_INVOKE: &str = "tool_invoke";

/// Whether `name` is one of the three meta-tools.
pub fn is_meta_tool(name: &str) -> bool {
    matches!(name, META_TOOL_LIST | META_TOOL_SCHEMA | META_TOOL_INVOKE)
}

/// Definitions for the three meta-tools, in listing order.
pub fn meta_tool_definitions() -> Vec<Tool> {
    vec![
        Tool::new(
            META_TOOL_LIST,
            ToolSchema::object().with_properties(HashMap::from([
                (
                    "server".to_string(),
                    json!({"type": "string", "description": "Only list tools from this server"}),
                ),
                (
                    "pattern".to_string(),
                    json!({"type": "string", "description": "Glob over tool names (* and ?)"}),
                ),
                (
                    "tag".to_string(),
                    json!({"type": "string", "description": "Only list tools whose server carries this tag"}),
                ),
                (
                    "limit".to_string(),
                    json!({"type": "integer", "minimum": 1, "description": "Page size"}),
                ),
                (
                    "cursor".to_string(),
                    json!({"type": "string", "description": "Opaque cursor from a previous page"}),
                ),
            ])),
        )
        .with_description(
            "List available tools across all connected servers. Returns catalogue metadata \
             only; fetch full schemas with tool_schema.",
        ),
        Tool::new(
            META_TOOL_SCHEMA,
            ToolSchema::object()
                .with_properties(HashMap::from([
                    ("server".to_string(), json!({"type": "string"})),
                    ("toolName".to_string(), json!({"type": "string"})),
                ]))
                .with_required(vec!["server".to_string(), "toolName".to_string()]),
        )
        .with_description("Fetch the full input schema for one tool."),
        Tool::new(
            META_TOOL_INVOKE,
            ToolSchema::object()
                .with_properties(HashMap::from([
                    ("server".to_string(), json!({"type": "string"})),
                    ("toolName".to_string(), json!({"type": "string"})),
                    (
                        "args".to_string(),
                        json!({"type": "object", "description": "Arguments forwarded to the tool"}),
                    ),
                ]))
                .with_required(vec!["server".to_string(), "toolName".to_string()]),
        )
        .with_description("Invoke a tool on its server, forwarding args verbatim."),
    ]
}

/// Response of `tool_list`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolListResponse {
    pub tools: Vec<ToolMetadata>,
    pub total_count: usize,
    pub servers: Vec<String>,
    pub has_more: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<MetaToolError>,
}

impl ToolListResponse {
    pub fn error(error: MetaToolError) -> Self {
        Self {
            tools: Vec::new(),
            total_count: 0,
            servers: Vec::new(),
            has_more: false,
            next_cursor: None,
            error: Some(error),
        }
    }
}

/// Response of `tool_schema`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolSchemaResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<Tool>,
    pub from_cache: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<MetaToolError>,
}

impl ToolSchemaResponse {
    pub fn hit(schema: Tool, from_cache: bool) -> Self {
        Self {
            schema: Some(schema),
            from_cache,
            error: None,
        }
    }

    pub fn error(error: MetaToolError) -> Self {
        Self {
            schema: None,
            from_cache: false,
            error: Some(error),
        }
    }
}

/// Response of `tool_invoke`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInvokeResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<CallToolResult>,
    pub server: String,
    pub tool: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<MetaToolError>,
}

impl ToolInvokeResponse {
    pub fn ok(server: impl Into<String>, tool: impl Into<String>, result: CallToolResult) -> Self {
        Self {
            result: Some(result),
            server: server.into(),
            tool: tool.into(),
            error: None,
        }
    }

    pub fn error(
        server: impl Into<String>,
        tool: impl Into<String>,
        error: MetaToolError,
    ) -> Self {
        Self {
            result: None,
            server: server.into(),
            tool: tool.into(),
            error: Some(error),
        }
    }
}

/// Fold a serializable meta-tool response into a tool call result: JSON text
/// content plus the same value as structured content.
pub fn to_call_result<T: Serialize>(response: &T, is_error: bool) -> CallToolResult {
    let value = serde_json::to_value(response).unwrap_or_else(|e| {
        json!({"error": {"type": "internal", "message": format!("serialization failed: {e}")}})
    });
    let text = serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string());
    let mut result = CallToolResult::from_text(text).with_structured_content(value);
    if is_error {
        result.is_error = Some(true);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn definitions_are_exactly_the_three_meta_tools() {
        let names: Vec<String> = meta_tool_definitions()
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert_eq!(names, vec![META_TOOL_LIST, META_TOOL_SCHEMA, META_TOOL_INVOKE]);
        assert!(is_meta_tool("tool_invoke"));
        assert!(!is_meta_tool("tools_invoke"));
    }

    #[test]
    fn invoke_schema_requires_server_and_tool_name() {
        let tools = meta_tool_definitions();
        let invoke = tools.iter().find(|t| t.name == META_TOOL_INVOKE).unwrap();
        let required = invoke.input_schema.required.as_ref().unwrap();
        assert!(required.contains(&"server".to_string()));
        assert!(required.contains(&"toolName".to_string()));
    }

    #[test]
    fn error_response_serializes_structured_error() {
        let response = ToolInvokeResponse::error(
            "database",
            "query",
            MetaToolError::not_found("Tool not found: database:query (out of session scope)"),
        );
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["error"]["type"], "not_found");
        assert!(value.get("result").is_none());
    }
}
