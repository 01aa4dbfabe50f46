//! Request handler layer: binds inbound MCP verbs to routing, filtering,
//! aggregation and the meta-tool subsystem.
//!
//! Every verb first narrows the connection set with three composed filters:
//! session visibility (static servers plus this session's template
//! instances), required capability, then the session's tag filter. List
//! verbs fan out through [`paginate`]; single-target verbs resolve one
//! connection from the composite name.

use serde_json::Value;
use std::sync::{Arc, RwLock};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use onemcp_protocol::{
    CallToolResult, CompleteParams, CompleteResult, CompletionReference, EmptyResult,
    GetPromptParams, GetPromptResult, ListPromptsResult, ListResourceTemplatesResult,
    ListResourcesResult, ListToolsResult, McpError, Prompt, ReadResourceResult, Resource,
    ResourceTemplate, Tool,
};

use crate::aggregator::{CapabilityAggregator, InstructionAggregator};
use crate::config::{ProxyConfig, SessionConfig};
use crate::connection::{ConnectionManager, OutboundConnection};
use crate::error::{MetaToolError, ProxyError, ProxyResult};
use crate::filtering::FilteringService;
use crate::internal::InternalToolProvider;
use crate::lazy::{self, LazyLoadingOrchestrator};
use crate::routing::{
    build_uri, paginate, parse_uri, resolve_outbound_connection, PageFetch,
    filter_connections_for_session, INTERNAL_SERVER_NAME,
};
use crate::session::SessionRegistry;
use crate::template::SessionTemplateHashes;

/// Capability a verb needs from a connection to include it in a fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequiredCapability {
    Tools,
    Resources,
    Prompts,
    Any,
}

/// Binds inbound verbs to the gateway subsystems.
pub struct RequestHandler {
    config: Arc<ProxyConfig>,
    connections: Arc<ConnectionManager>,
    aggregator: Arc<CapabilityAggregator>,
    instructions: Arc<InstructionAggregator>,
    filtering: Arc<FilteringService>,
    lazy: Arc<LazyLoadingOrchestrator>,
    internal: Arc<dyn InternalToolProvider>,
    sessions: Arc<SessionRegistry>,
    session_hashes: Arc<RwLock<SessionTemplateHashes>>,
}

impl RequestHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<ProxyConfig>,
        connections: Arc<ConnectionManager>,
        aggregator: Arc<CapabilityAggregator>,
        instructions: Arc<InstructionAggregator>,
        filtering: Arc<FilteringService>,
        lazy: Arc<LazyLoadingOrchestrator>,
        internal: Arc<dyn InternalToolProvider>,
        sessions: Arc<SessionRegistry>,
        session_hashes: Arc<RwLock<SessionTemplateHashes>>,
    ) -> Self {
        Self {
            config,
            connections,
            aggregator,
            instructions,
            filtering,
            lazy,
            internal,
            sessions,
            session_hashes,
        }
    }

    fn session_config(&self, session_id: &str) -> SessionConfig {
        self.sessions.config_for(session_id, &self.config.session)
    }

    fn session_hashes_snapshot(&self) -> SessionTemplateHashes {
        self.session_hashes
            .read()
            .expect("session hashes lock poisoned")
            .clone()
    }

    /// Compose the three connection filters for one verb.
    fn effective_connections(
        &self,
        session_id: &str,
        required: RequiredCapability,
    ) -> Vec<Arc<OutboundConnection>> {
        let snapshot = self.connections.snapshot();
        let hashes = self.session_hashes_snapshot();
        let session_visible = filter_connections_for_session(&snapshot, session_id, &hashes);

        let capable: Vec<Arc<OutboundConnection>> = session_visible
            .into_iter()
            .filter(|connection| {
                if !connection.is_connected() {
                    return false;
                }
                let capabilities = connection.capabilities().unwrap_or_default();
                match required {
                    RequiredCapability::Tools => capabilities.has_tools(),
                    RequiredCapability::Resources => capabilities.has_resources(),
                    RequiredCapability::Prompts => capabilities.has_prompts(),
                    RequiredCapability::Any => true,
                }
            })
            .collect();

        let session = self.session_config(session_id);
        self.filtering.filtered_connections(capable, &session)
    }

    fn resolve(&self, name: &str, session_id: &str) -> Option<Arc<OutboundConnection>> {
        let snapshot = self.connections.snapshot();
        let hashes = self.session_hashes_snapshot();
        resolve_outbound_connection(name, session_id, &snapshot, &hashes)
    }

    fn resolve_connected(
        &self,
        name: &str,
        session_id: &str,
    ) -> ProxyResult<Arc<OutboundConnection>> {
        let connection = self
            .resolve(name, session_id)
            .ok_or_else(|| ProxyError::UnknownConnection(name.to_string()))?;
        if !connection.is_connected() {
            return Err(ProxyError::NotConnected(name.to_string()));
        }
        Ok(connection)
    }

    /// The composed connection set for one session and capability; exposed
    /// for callers that need the visible server set itself (session setup,
    /// status surfaces).
    pub fn effective_connections_for(
        &self,
        session_id: &str,
        required: RequiredCapability,
    ) -> Vec<Arc<OutboundConnection>> {
        self.effective_connections(session_id, required)
    }

    /// The instructions preamble for one session.
    pub fn instructions_for_session(&self, session_id: &str) -> String {
        let connections = self.effective_connections(session_id, RequiredCapability::Any);
        let session = self.session_config(session_id);
        self.instructions.aggregate(&connections, &session)
    }

    // --- tools ---

    pub async fn list_tools(
        &self,
        session_id: &str,
        cursor: Option<String>,
    ) -> ProxyResult<ListToolsResult> {
        if self.lazy.enabled() {
            return Ok(self.list_tools_lazy(session_id));
        }

        let connections = self.effective_connections(session_id, RequiredCapability::Tools);
        let session = self.session_config(session_id);
        let fetch: PageFetch<Tool> = Arc::new(|connection, cursor| {
            Box::pin(async move {
                let page = connection.client.list_tools(cursor).await?;
                let tools = page
                    .tools
                    .into_iter()
                    .filter(|tool| connection.filters.allows_tool(&tool.name))
                    .map(|mut tool| {
                        tool.name = build_uri(connection.base_name(), &tool.name);
                        tool
                    })
                    .collect();
                Ok((tools, page.next_cursor))
            })
        });

        let (tools, next_cursor) =
            paginate(connections, cursor, session.enable_pagination, fetch).await?;
        Ok(ListToolsResult { tools, next_cursor })
    }

    /// Lazy-mode tool surface: the three meta-tools, the internal provider's
    /// tools under the `1mcp` prefix, and any direct-expose entries.
    fn list_tools_lazy(&self, session_id: &str) -> ListToolsResult {
        let mut tools = lazy::meta_tool_definitions();

        for tool in self.internal.list_tools() {
            let mut tool = tool;
            tool.name = build_uri(INTERNAL_SERVER_NAME, &tool.name);
            tools.push(tool);
        }

        if !self.lazy.config().direct_expose.is_empty() {
            let allowed = self.lazy.allowed_servers(session_id);
            let snapshot = self.aggregator.get_current_capabilities();
            for entry in &snapshot.tools {
                if !self
                    .lazy
                    .config()
                    .direct_expose
                    .iter()
                    .any(|name| name == &entry.tool.name)
                {
                    continue;
                }
                if let Some(allowed) = &allowed {
                    if !allowed.contains(&entry.server) {
                        continue;
                    }
                }
                let mut tool = entry.tool.clone();
                tool.name = build_uri(&entry.server, &tool.name);
                tools.push(tool);
            }
        }

        ListToolsResult {
            tools,
            next_cursor: None,
        }
    }

    pub async fn call_tool(
        &self,
        session_id: &str,
        name: &str,
        arguments: Option<Value>,
    ) -> ProxyResult<CallToolResult> {
        if let Some(parsed) = parse_uri(name) {
            if parsed.is_internal() {
                return Ok(self.internal.call_tool(parsed.name, arguments).await?);
            }
            let connection = self.resolve_connected(parsed.server, session_id)?;
            if !connection.filters.allows_tool(parsed.name) {
                return Err(McpError::ToolNotFound(name.to_string()).into());
            }
            debug!(server = %connection.key(), tool = parsed.name, "forwarding tool call");
            return Ok(connection.client.call_tool(parsed.name, arguments).await?);
        }

        if self.lazy.enabled() {
            if lazy::is_meta_tool(name) {
                let args = arguments.unwrap_or_else(|| Value::Object(Default::default()));
                return Ok(self.lazy.handle_meta_tool(name, &args, session_id).await);
            }
            // Unprefixed non-meta names in lazy mode answer in-band rather
            // than failing the MCP call.
            let error = MetaToolError::not_found(format!("Tool not found: {name}"));
            return Ok(lazy::meta_tools::to_call_result(
                &serde_json::json!({ "error": error }),
                true,
            ));
        }

        Err(McpError::ToolNotFound(name.to_string()).into())
    }

    // --- resources ---

    pub async fn list_resources(
        &self,
        session_id: &str,
        cursor: Option<String>,
    ) -> ProxyResult<ListResourcesResult> {
        let connections = self.effective_connections(session_id, RequiredCapability::Resources);
        let session = self.session_config(session_id);
        let fetch: PageFetch<Resource> = Arc::new(|connection, cursor| {
            Box::pin(async move {
                let page = connection.client.list_resources(cursor).await?;
                let resources = page
                    .resources
                    .into_iter()
                    .filter(|resource| connection.filters.allows_resource(&resource.uri))
                    .map(|mut resource| {
                        resource.uri = build_uri(connection.base_name(), &resource.uri);
                        resource
                    })
                    .collect();
                Ok((resources, page.next_cursor))
            })
        });

        let (resources, next_cursor) =
            paginate(connections, cursor, session.enable_pagination, fetch).await?;
        Ok(ListResourcesResult {
            resources,
            next_cursor,
        })
    }

    pub async fn list_resource_templates(
        &self,
        session_id: &str,
        cursor: Option<String>,
    ) -> ProxyResult<ListResourceTemplatesResult> {
        let connections = self.effective_connections(session_id, RequiredCapability::Resources);
        let session = self.session_config(session_id);
        let fetch: PageFetch<ResourceTemplate> = Arc::new(|connection, cursor| {
            Box::pin(async move {
                let page = connection.client.list_resource_templates(cursor).await?;
                let templates = page
                    .resource_templates
                    .into_iter()
                    .map(|mut template| {
                        template.uri_template =
                            build_uri(connection.base_name(), &template.uri_template);
                        template
                    })
                    .collect();
                Ok((templates, page.next_cursor))
            })
        });

        let (resource_templates, next_cursor) =
            paginate(connections, cursor, session.enable_pagination, fetch).await?;
        Ok(ListResourceTemplatesResult {
            resource_templates,
            next_cursor,
        })
    }

    pub async fn read_resource(
        &self,
        session_id: &str,
        uri: &str,
    ) -> ProxyResult<ReadResourceResult> {
        let parsed = parse_uri(uri)
            .ok_or_else(|| McpError::ResourceNotFound(uri.to_string()))?;
        let connection = self.resolve_connected(parsed.server, session_id)?;
        if !connection.filters.allows_resource(parsed.name) {
            return Err(McpError::ResourceNotFound(uri.to_string()).into());
        }

        let result = connection.client.read_resource(parsed.name).await?;
        // Contents come back under upstream uris; re-prefix them so the
        // client can read them again through the gateway.
        let base = connection.base_name().to_string();
        let contents = result
            .contents
            .into_iter()
            .map(|contents| {
                let inner = contents.uri().to_string();
                contents.with_uri(build_uri(&base, &inner))
            })
            .collect();
        Ok(ReadResourceResult { contents })
    }

    pub async fn subscribe(&self, session_id: &str, uri: &str) -> ProxyResult<EmptyResult> {
        let parsed = parse_uri(uri)
            .ok_or_else(|| McpError::ResourceNotFound(uri.to_string()))?;
        let connection = self.resolve_connected(parsed.server, session_id)?;
        Ok(connection.client.subscribe(parsed.name).await?)
    }

    pub async fn unsubscribe(&self, session_id: &str, uri: &str) -> ProxyResult<EmptyResult> {
        let parsed = parse_uri(uri)
            .ok_or_else(|| McpError::ResourceNotFound(uri.to_string()))?;
        let connection = self.resolve_connected(parsed.server, session_id)?;
        Ok(connection.client.unsubscribe(parsed.name).await?)
    }

    // --- prompts ---

    pub async fn list_prompts(
        &self,
        session_id: &str,
        cursor: Option<String>,
    ) -> ProxyResult<ListPromptsResult> {
        let connections = self.effective_connections(session_id, RequiredCapability::Prompts);
        let session = self.session_config(session_id);
        let fetch: PageFetch<Prompt> = Arc::new(|connection, cursor| {
            Box::pin(async move {
                let page = connection.client.list_prompts(cursor).await?;
                let prompts = page
                    .prompts
                    .into_iter()
                    .filter(|prompt| connection.filters.allows_prompt(&prompt.name))
                    .map(|mut prompt| {
                        prompt.name = build_uri(connection.base_name(), &prompt.name);
                        prompt
                    })
                    .collect();
                Ok((prompts, page.next_cursor))
            })
        });

        let (prompts, next_cursor) =
            paginate(connections, cursor, session.enable_pagination, fetch).await?;
        Ok(ListPromptsResult {
            prompts,
            next_cursor,
        })
    }

    pub async fn get_prompt(
        &self,
        session_id: &str,
        params: GetPromptParams,
    ) -> ProxyResult<GetPromptResult> {
        let parsed = parse_uri(&params.name)
            .ok_or_else(|| McpError::PromptNotFound(params.name.clone()))?;
        let connection = self.resolve_connected(parsed.server, session_id)?;
        if !connection.filters.allows_prompt(parsed.name) {
            return Err(McpError::PromptNotFound(params.name.clone()).into());
        }
        let upstream = GetPromptParams {
            name: parsed.name.to_string(),
            arguments: params.arguments,
        };
        Ok(connection.client.get_prompt(upstream).await?)
    }

    // --- completion ---

    pub async fn complete(
        &self,
        session_id: &str,
        params: CompleteParams,
    ) -> ProxyResult<CompleteResult> {
        let (server, stripped_reference) = match &params.reference {
            CompletionReference::Prompt(reference) => {
                let parsed = parse_uri(&reference.name)
                    .ok_or_else(|| McpError::PromptNotFound(reference.name.clone()))?;
                (
                    parsed.server.to_string(),
                    CompletionReference::prompt(parsed.name),
                )
            }
            CompletionReference::ResourceTemplate(reference) => {
                let parsed = parse_uri(&reference.uri)
                    .ok_or_else(|| McpError::ResourceNotFound(reference.uri.clone()))?;
                (
                    parsed.server.to_string(),
                    CompletionReference::resource(parsed.name),
                )
            }
        };

        let connection = self.resolve_connected(&server, session_id)?;
        let upstream = CompleteParams {
            reference: stripped_reference,
            argument: params.argument,
        };
        Ok(connection.client.complete(upstream).await?)
    }

    // --- ping ---

    /// Health probe: ping every connected upstream concurrently. Individual
    /// failures are logged; the probe itself always succeeds.
    pub async fn ping(&self, _session_id: &str) -> ProxyResult<EmptyResult> {
        let connections = self.connections.connected_sorted();
        let mut join_set = JoinSet::new();
        for connection in connections {
            join_set.spawn(async move {
                let result = connection.client.ping().await;
                (connection.key().to_string(), result)
            });
        }
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((_, Ok(_))) => {}
                Ok((key, Err(e))) => warn!(server = %key, "upstream ping failed: {e}"),
                Err(e) => warn!("task panic during ping fan-out: {e}"),
            }
        }
        Ok(EmptyResult::new())
    }
}
