//! Shared test support: a mock upstream MCP server behind the in-memory
//! channel transport, and a connector that builds clients against it.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use onemcp_client::{ChannelPeer, ChannelTransport, ClientConfig, ClientResult, McpClient};
use onemcp_protocol::{
    CallToolResult, CompleteResult, EmptyResult, ErrorObject, GetPromptResult, JsonRpcMessage,
    JsonRpcResponse, ListPromptsResult, ListResourceTemplatesResult, ListResourcesResult,
    ListToolsResult, Prompt, PromptMessage, ReadResourceResult, Resource, ResourceContents,
    ResourceTemplate, Tool, ToolSchema, MCP_VERSION,
};
use onemcp_proxy::{ServerConfig, TransportConfig, UpstreamConnector};

/// Behaviour of one mock upstream.
#[derive(Clone, Default)]
pub struct MockSpec {
    pub tools: Vec<Tool>,
    pub resources: Vec<Resource>,
    pub resource_templates: Vec<ResourceTemplate>,
    pub prompts: Vec<Prompt>,
    pub instructions: Option<String>,
    /// Delay before answering tools/list, to widen coalescing windows
    pub list_delay: Option<Duration>,
    /// Answer resources/list with an error
    pub fail_resources: bool,
    /// Answer ping with an error
    pub fail_ping: bool,
    /// Refuse the connection outright (client build yields a dead channel)
    pub fail_connect: bool,
}

impl MockSpec {
    pub fn with_tools(names: &[&str]) -> Self {
        Self {
            tools: names.iter().map(|name| tool(name)).collect(),
            ..Default::default()
        }
    }

    pub fn with_resources(mut self, uris: &[&str]) -> Self {
        self.resources = uris
            .iter()
            .map(|uri| Resource::new(*uri, uri.rsplit('/').next().unwrap_or(uri)))
            .collect();
        self
    }

    pub fn with_prompts(mut self, names: &[&str]) -> Self {
        self.prompts = names.iter().map(|name| Prompt::new(*name)).collect();
        self
    }

    pub fn with_instructions(mut self, instructions: &str) -> Self {
        self.instructions = Some(instructions.to_string());
        self
    }
}

pub fn tool(name: &str) -> Tool {
    Tool::new(name, ToolSchema::object()).with_description(format!("mock tool {name}"))
}

/// A simple static server definition; the mock connector ignores the
/// transport except for template rendering assertions.
pub fn http_server(tags: &[&str]) -> ServerConfig {
    let mut config = ServerConfig::new(TransportConfig::Http {
        url: "http://upstream.invalid/mcp".into(),
        headers: HashMap::new(),
    });
    config.tags = tags.iter().map(|t| t.to_string()).collect();
    config
}

/// One client the connector built, with its observable side effects.
pub struct SpawnedServer {
    pub name: String,
    pub config: ServerConfig,
    /// `(tool name, arguments)` per tools/call received
    pub calls: Arc<Mutex<Vec<(String, Option<Value>)>>>,
    /// Incremented when the serving task sees the transport close
    pub closed: Arc<AtomicUsize>,
}

/// Connector that serves every built client from a [`MockSpec`].
#[derive(Default)]
pub struct MockConnector {
    specs: Mutex<HashMap<String, MockSpec>>,
    spawned: Mutex<Vec<Arc<SpawnedServer>>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_server(self, name: &str, spec: MockSpec) -> Self {
        self.specs.lock().unwrap().insert(name.to_string(), spec);
        self
    }

    pub fn spawned_for(&self, name: &str) -> Vec<Arc<SpawnedServer>> {
        self.spawned
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.name == name)
            .cloned()
            .collect()
    }

    /// Recorded tools/call invocations across every client built for `name`.
    pub fn calls_for(&self, name: &str) -> Vec<(String, Option<Value>)> {
        self.spawned_for(name)
            .iter()
            .flat_map(|s| s.calls.lock().unwrap().clone())
            .collect()
    }
}

#[async_trait]
impl UpstreamConnector for MockConnector {
    async fn build(&self, name: &str, config: &ServerConfig) -> ClientResult<Arc<McpClient>> {
        let spec = self
            .specs
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .unwrap_or_default();

        let (transport, peer) = ChannelTransport::pair();
        let record = Arc::new(SpawnedServer {
            name: name.to_string(),
            config: config.clone(),
            calls: Arc::new(Mutex::new(Vec::new())),
            closed: Arc::new(AtomicUsize::new(0)),
        });
        self.spawned.lock().unwrap().push(record.clone());

        if spec.fail_connect {
            // Drop the peer: the handshake dies on a closed channel.
            drop(peer);
        } else {
            tokio::spawn(serve_mock(peer, spec, record));
        }
        Ok(Arc::new(McpClient::new(
            Box::new(transport),
            ClientConfig::default(),
        )))
    }
}

async fn serve_mock(mut peer: ChannelPeer, spec: MockSpec, record: Arc<SpawnedServer>) {
    loop {
        let message = match peer.incoming.recv().await {
            Some(message) => message,
            None => {
                record.closed.fetch_add(1, Ordering::SeqCst);
                return;
            }
        };
        let request = match message {
            JsonRpcMessage::Request(request) => request,
            _ => continue,
        };
        let id = request.id.clone();
        let params = request.params.unwrap_or(Value::Null);

        let reply: Result<Value, ErrorObject> = match request.method.as_str() {
            "initialize" => {
                let mut capabilities = json!({"tools": {"listChanged": true}});
                if !spec.resources.is_empty() || !spec.resource_templates.is_empty() || spec.fail_resources {
                    capabilities["resources"] = json!({"subscribe": true, "listChanged": true});
                }
                if !spec.prompts.is_empty() {
                    capabilities["prompts"] = json!({"listChanged": true});
                }
                let mut result = json!({
                    "protocolVersion": MCP_VERSION,
                    "capabilities": capabilities,
                    "serverInfo": {"name": record.name, "version": "1.0.0"},
                });
                if let Some(instructions) = &spec.instructions {
                    result["instructions"] = json!(instructions);
                }
                Ok(result)
            }
            "tools/list" => {
                if let Some(delay) = spec.list_delay {
                    tokio::time::sleep(delay).await;
                }
                Ok(serde_json::to_value(ListToolsResult::new(spec.tools.clone())).unwrap())
            }
            "tools/call" => {
                let name = params["name"].as_str().unwrap_or_default().to_string();
                let arguments = params.get("arguments").cloned();
                record.calls.lock().unwrap().push((name.clone(), arguments));
                if spec.tools.iter().any(|t| t.name == name) {
                    Ok(serde_json::to_value(CallToolResult::from_text(format!("ok:{name}")))
                        .unwrap())
                } else {
                    Err(ErrorObject::new(-32602, format!("Tool not found: {name}")))
                }
            }
            "resources/list" => {
                if spec.fail_resources {
                    Err(ErrorObject::new(-32603, "resource backend unavailable"))
                } else {
                    Ok(serde_json::to_value(ListResourcesResult::new(spec.resources.clone()))
                        .unwrap())
                }
            }
            "resources/templates/list" => Ok(serde_json::to_value(
                ListResourceTemplatesResult::new(spec.resource_templates.clone()),
            )
            .unwrap()),
            "resources/read" => {
                let uri = params["uri"].as_str().unwrap_or_default().to_string();
                Ok(serde_json::to_value(ReadResourceResult::new(vec![
                    ResourceContents::text(&uri, format!("contents of {uri}")),
                ]))
                .unwrap())
            }
            "resources/subscribe" | "resources/unsubscribe" => {
                Ok(serde_json::to_value(EmptyResult::new()).unwrap())
            }
            "prompts/list" => {
                Ok(serde_json::to_value(ListPromptsResult::new(spec.prompts.clone())).unwrap())
            }
            "prompts/get" => {
                let name = params["name"].as_str().unwrap_or_default();
                if spec.prompts.iter().any(|p| p.name == name) {
                    Ok(serde_json::to_value(GetPromptResult {
                        description: Some(format!("mock prompt {name}")),
                        messages: vec![PromptMessage::user_text("hello from mock")],
                    })
                    .unwrap())
                } else {
                    Err(ErrorObject::new(-32602, format!("Prompt not found: {name}")))
                }
            }
            "completion/complete" => Ok(serde_json::to_value(CompleteResult::new(vec![
                "alpha".to_string(),
                "beta".to_string(),
            ]))
            .unwrap()),
            "ping" => {
                if spec.fail_ping {
                    Err(ErrorObject::new(-32603, "ping refused"))
                } else {
                    Ok(serde_json::to_value(EmptyResult::new()).unwrap())
                }
            }
            other => Err(ErrorObject::new(-32601, format!("method not found: {other}"))),
        };

        let response = match reply {
            Ok(result) => JsonRpcResponse::success(id, result),
            Err(error) => JsonRpcResponse::error(id, error),
        };
        let _ = peer.outgoing.send(JsonRpcMessage::Response(response));
    }
}
