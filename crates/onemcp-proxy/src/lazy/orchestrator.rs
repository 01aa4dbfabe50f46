//! Lazy loading orchestrator: owns the registry and schema cache, answers
//! the three meta-tools, and scopes everything per session.

use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use onemcp_protocol::{CallToolResult, Prompt, Resource, Tool};

use crate::aggregator::CapabilitySnapshot;
use crate::config::LazyLoadingConfig;
use crate::connection::ConnectionManager;
use crate::error::MetaToolError;
use crate::lazy::cache::{SchemaCache, SchemaCacheError};
use crate::lazy::meta_tools::{
    self, ToolInvokeResponse, ToolListResponse, ToolSchemaResponse, META_TOOL_INVOKE,
    META_TOOL_LIST, META_TOOL_SCHEMA,
};
use crate::lazy::registry::{compile_glob, ListToolsQuery, ToolMetadata, ToolRegistry};
use crate::routing::{self, build_uri};
use crate::template::SessionTemplateHashes;

/// Assumed token weight of a tool schema we have not loaded yet.
const DEFAULT_SCHEMA_TOKEN_ESTIMATE: u64 = 160;

/// A deferred upstream schema load, consumable by the cache's single-flight
/// path.
type SchemaLoaderFn =
    Box<dyn FnOnce() -> futures::future::BoxFuture<'static, Result<Tool, SchemaCacheError>> + Send>;

/// Rough token estimate for serialized JSON.
fn estimate_tokens(value: &impl Serialize) -> u64 {
    serde_json::to_string(value)
        .map(|s| (s.len() as u64).div_ceil(4))
        .unwrap_or(0)
}

/// Token accounting for the lazy surface vs a full catalogue load.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenSavings {
    pub current_tokens: u64,
    pub full_load_tokens: u64,
    pub saved_tokens: u64,
    pub savings_percentage: f64,
}

/// Orchestrator statistics.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LazyStats {
    pub enabled: bool,
    pub registered_tool_count: usize,
    pub loaded_tool_count: u64,
    pub cached_tool_count: usize,
    pub cache_hit_rate: f64,
    pub token_savings: TokenSavings,
    pub coalesced_requests: u64,
    pub evictions: u64,
}

/// Lazy-mode capability view for one session's allowed servers.
#[derive(Debug, Clone)]
pub struct FilteredCapabilities {
    /// Exactly the three meta-tool definitions
    pub tools: Vec<Tool>,
    /// Namespaced resources from allowed servers
    pub resources: Vec<Resource>,
    /// Namespaced prompts from allowed servers
    pub prompts: Vec<Prompt>,
    /// Ready connection keys whose base name is allowed
    pub servers: Vec<String>,
}

/// Owns the registry, cache, and meta-tool behaviour.
pub struct LazyLoadingOrchestrator {
    config: LazyLoadingConfig,
    cache: SchemaCache,
    registry: RwLock<Arc<ToolRegistry>>,
    allowed_servers: RwLock<HashMap<String, HashSet<String>>>,
    connections: Arc<ConnectionManager>,
    session_hashes: Arc<RwLock<SessionTemplateHashes>>,
}

impl LazyLoadingOrchestrator {
    pub fn new(
        config: LazyLoadingConfig,
        connections: Arc<ConnectionManager>,
        session_hashes: Arc<RwLock<SessionTemplateHashes>>,
    ) -> Self {
        let cache = SchemaCache::new(config.cache.clone());
        Self {
            config,
            cache,
            registry: RwLock::new(Arc::new(ToolRegistry::default())),
            allowed_servers: RwLock::new(HashMap::new()),
            connections,
            session_hashes,
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn config(&self) -> &LazyLoadingConfig {
        &self.config
    }

    pub fn cache(&self) -> &SchemaCache {
        &self.cache
    }

    pub fn registry(&self) -> Arc<ToolRegistry> {
        self.registry.read().expect("registry lock poisoned").clone()
    }

    /// Rebuild the registry from an aggregated snapshot. Server tags come
    /// from the connection configurations.
    pub fn rebuild_registry(&self, snapshot: &CapabilitySnapshot) {
        let mut server_tools: HashMap<String, Vec<ToolMetadata>> = HashMap::new();
        for entry in &snapshot.tools {
            let mut metadata = ToolMetadata::new(&entry.server, &entry.tool.name);
            metadata.description = entry.tool.description.clone();
            server_tools.entry(entry.server.clone()).or_default().push(metadata);
        }

        let mut server_tags: HashMap<String, Vec<String>> = HashMap::new();
        for connection in self.connections.snapshot().values() {
            if !connection.config.tags.is_empty() {
                server_tags
                    .entry(connection.base_name().to_string())
                    .or_insert_with(|| connection.config.tags.clone());
            }
        }

        let registry = ToolRegistry::from_tools_map(server_tools, server_tags);
        debug!(tools = registry.len(), "rebuilt lazy tool registry");
        *self.registry.write().expect("registry lock poisoned") = Arc::new(registry);
    }

    /// Restrict (or unrestrict) the servers a session's meta-tools may see.
    pub fn set_allowed_servers(&self, session_id: &str, allowed: Option<HashSet<String>>) {
        let mut map = self
            .allowed_servers
            .write()
            .expect("allowed servers lock poisoned");
        match allowed {
            Some(allowed) => {
                map.insert(session_id.to_string(), allowed);
            }
            None => {
                map.remove(session_id);
            }
        }
    }

    pub fn allowed_servers(&self, session_id: &str) -> Option<HashSet<String>> {
        self.allowed_servers
            .read()
            .expect("allowed servers lock poisoned")
            .get(session_id)
            .cloned()
    }

    /// Forget a session's scoping state.
    pub fn remove_session(&self, session_id: &str) {
        self.allowed_servers
            .write()
            .expect("allowed servers lock poisoned")
            .remove(session_id);
    }

    /// The registry as one session sees it.
    fn session_registry(&self, session_id: &str) -> Arc<ToolRegistry> {
        match self.allowed_servers(session_id) {
            Some(allowed) => Arc::new(self.registry().filter_by_servers(&allowed)),
            None => self.registry(),
        }
    }

    /// Store a session's allowed-server set and return the lazy-mode
    /// capability view for it.
    pub fn capabilities_for_filtered_servers(
        &self,
        snapshot: &CapabilitySnapshot,
        allowed: HashSet<String>,
        session_id: &str,
    ) -> FilteredCapabilities {
        self.set_allowed_servers(session_id, Some(allowed.clone()));

        let resources = snapshot
            .resources
            .iter()
            .filter(|entry| allowed.contains(&entry.server))
            .map(|entry| {
                let mut resource = entry.resource.clone();
                resource.uri = build_uri(&entry.server, &resource.uri);
                resource
            })
            .collect();
        let prompts = snapshot
            .prompts
            .iter()
            .filter(|entry| allowed.contains(&entry.server))
            .map(|entry| {
                let mut prompt = entry.prompt.clone();
                prompt.name = build_uri(&entry.server, &prompt.name);
                prompt
            })
            .collect();
        let servers = snapshot
            .ready_servers
            .iter()
            .filter(|key| {
                let base = key.split(':').next().unwrap_or(key);
                allowed.contains(base)
            })
            .cloned()
            .collect();

        FilteredCapabilities {
            tools: meta_tools::meta_tool_definitions(),
            resources,
            prompts,
            servers,
        }
    }

    /// Dispatch one of the three meta-tools by name.
    pub async fn handle_meta_tool(
        &self,
        name: &str,
        args: &Value,
        session_id: &str,
    ) -> CallToolResult {
        match name {
            META_TOOL_LIST => {
                let response = self.tool_list(session_id, args);
                meta_tools::to_call_result(&response, response.error.is_some())
            }
            META_TOOL_SCHEMA => {
                let response = self.tool_schema(session_id, args).await;
                meta_tools::to_call_result(&response, response.error.is_some())
            }
            META_TOOL_INVOKE => {
                let response = self.tool_invoke(session_id, args).await;
                meta_tools::to_call_result(&response, response.error.is_some())
            }
            other => {
                let error = MetaToolError::not_found(format!("unknown meta-tool '{other}'"));
                meta_tools::to_call_result(&serde_json::json!({"error": error}), true)
            }
        }
    }

    /// `tool_list`: catalogue listing scoped to the session.
    pub fn tool_list(&self, session_id: &str, args: &Value) -> ToolListResponse {
        let query = match parse_list_query(args) {
            Ok(query) => query,
            Err(error) => return ToolListResponse::error(error),
        };

        match self.session_registry(session_id).list_tools(&query) {
            Ok(page) => ToolListResponse {
                tools: page.tools,
                total_count: page.total_count,
                servers: page.servers,
                has_more: page.has_more,
                next_cursor: page.next_cursor,
                error: None,
            },
            Err(e) => ToolListResponse::error(MetaToolError::validation(e.to_string())),
        }
    }

    /// `tool_schema`: full schema for one tool, cache first.
    pub async fn tool_schema(&self, session_id: &str, args: &Value) -> ToolSchemaResponse {
        let (server, tool_name) = match (string_arg(args, "server"), string_arg(args, "toolName"))
        {
            (Some(server), Some(tool)) => (server, tool),
            _ => {
                return ToolSchemaResponse::error(MetaToolError::validation(
                    "'server' and 'toolName' are required",
                ));
            }
        };

        if !self.session_registry(session_id).has_tool(&server, &tool_name) {
            return ToolSchemaResponse::error(MetaToolError::not_found(format!(
                "Tool not found: {server}:{tool_name}"
            )));
        }

        // `fromCache` reports whether this call triggered a fresh upstream
        // load; a coalesced waiter rides an existing load and reports a hit.
        let loaded = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let loader = {
            let loaded = loaded.clone();
            let inner = self.upstream_schema_loader(&server, &tool_name, session_id);
            move || {
                loaded.store(true, std::sync::atomic::Ordering::SeqCst);
                inner()
            }
        };
        match self.cache.get(&server, &tool_name, loader).await {
            Ok(schema) => ToolSchemaResponse::hit(
                schema,
                !loaded.load(std::sync::atomic::Ordering::SeqCst),
            ),
            Err(e) => ToolSchemaResponse::error(MetaToolError::upstream(e.to_string())),
        }
    }

    /// `tool_invoke`: scoped dispatch of one tool call.
    pub async fn tool_invoke(&self, session_id: &str, args: &Value) -> ToolInvokeResponse {
        let server = string_arg(args, "server");
        let tool_name = string_arg(args, "toolName");
        let (server, tool_name) = match (server, tool_name) {
            (Some(server), Some(tool)) => (server, tool),
            (server, tool) => {
                return ToolInvokeResponse::error(
                    server.unwrap_or_default(),
                    tool.unwrap_or_default(),
                    MetaToolError::validation("'server' and 'toolName' are required"),
                );
            }
        };

        let call_args = match args.get("args") {
            None | Some(Value::Null) => None,
            Some(value @ Value::Object(_)) => Some(value.clone()),
            Some(_) => {
                return ToolInvokeResponse::error(
                    server,
                    tool_name,
                    MetaToolError::validation("'args' must be an object"),
                );
            }
        };

        if !self.session_registry(session_id).has_tool(&server, &tool_name) {
            return ToolInvokeResponse::error(
                server.clone(),
                tool_name.clone(),
                MetaToolError::not_found(format!(
                    "Tool not found: {server}:{tool_name} (unknown or out of session scope)"
                )),
            );
        }

        let connection = {
            let snapshot = self.connections.snapshot();
            let hashes = self
                .session_hashes
                .read()
                .expect("session hashes lock poisoned")
                .clone();
            routing::resolve_outbound_connection(&server, session_id, &snapshot, &hashes)
        };
        let connection = match connection {
            Some(connection) if connection.is_connected() => connection,
            _ => {
                return ToolInvokeResponse::error(
                    server,
                    tool_name,
                    MetaToolError::upstream("not connected"),
                );
            }
        };

        match connection.client.call_tool(&tool_name, call_args).await {
            Ok(result) => ToolInvokeResponse::ok(server, tool_name, result),
            Err(e) => {
                let message = e.to_string();
                let lowered = message.to_lowercase();
                let error = if lowered.contains("tool not found")
                    || lowered.contains("unknown tool")
                {
                    MetaToolError::not_found(format!("Tool not found: {server}:{tool_name}"))
                } else {
                    MetaToolError::upstream(message)
                };
                ToolInvokeResponse::error(server, tool_name, error)
            }
        }
    }

    fn upstream_schema_loader(&self, server: &str, tool_name: &str, session_id: &str) -> SchemaLoaderFn {
        let connections = self.connections.clone();
        let session_hashes = self.session_hashes.clone();
        let server = server.to_string();
        let tool_name = tool_name.to_string();
        let session_id = session_id.to_string();
        let deadline = std::time::Duration::from_millis(self.config.fallback.timeout_ms);

        Box::new(move || {
            Box::pin(async move {
                let connection = {
                    let snapshot = connections.snapshot();
                    let hashes = session_hashes
                        .read()
                        .expect("session hashes lock poisoned")
                        .clone();
                    routing::resolve_outbound_connection(&server, &session_id, &snapshot, &hashes)
                };
                let connection = connection
                    .filter(|c| c.is_connected())
                    .ok_or_else(|| SchemaCacheError::Loader(format!("{server} is not connected")))?;

                let load = async {
                    let mut cursor: Option<String> = None;
                    loop {
                        let page = connection
                            .client
                            .list_tools(cursor.clone())
                            .await
                            .map_err(|e| SchemaCacheError::Loader(e.to_string()))?;
                        if let Some(tool) = page.tools.into_iter().find(|t| t.name == tool_name) {
                            return Ok(tool);
                        }
                        match page.next_cursor {
                            Some(next) if Some(&next) != cursor.as_ref() => cursor = Some(next),
                            _ => {
                                return Err(SchemaCacheError::Loader(format!(
                                    "tool not listed by upstream: {server}:{tool_name}"
                                )));
                            }
                        }
                    }
                };

                tokio::time::timeout(deadline, load)
                    .await
                    .map_err(|_| SchemaCacheError::Loader(format!("schema load timed out for {server}:{tool_name}")))?
            })
        })
    }

    /// Eagerly load schemas for servers matching `preload.patterns` globs or
    /// tools whose name contains a `preload.keywords` substring.
    pub async fn preload(&self) {
        let patterns: Vec<regex::Regex> = self
            .config
            .preload
            .patterns
            .iter()
            .filter_map(|pattern| match compile_glob(pattern) {
                Ok(regex) => Some(regex),
                Err(e) => {
                    warn!(pattern, "skipping unparseable preload pattern: {e}");
                    None
                }
            })
            .collect();
        let keywords = self.config.preload.keywords.clone();
        if patterns.is_empty() && keywords.is_empty() {
            return;
        }

        let targets: Vec<(String, String)> = self
            .registry()
            .iter()
            .filter(|metadata| {
                patterns.iter().any(|p| p.is_match(&metadata.server))
                    || keywords.iter().any(|k| metadata.name.contains(k.as_str()))
            })
            .map(|metadata| (metadata.server.clone(), metadata.name.clone()))
            .collect();

        let mut join_set = JoinSet::new();
        for (server, tool) in targets {
            let cache = self.cache.clone();
            let loader = self.upstream_schema_loader(&server, &tool, "");
            join_set.spawn(async move {
                if let Err(e) = cache.get(&server, &tool, loader).await {
                    warn!(server, tool, "preload failed: {e}");
                }
            });
        }
        let mut loaded = 0usize;
        while join_set.join_next().await.is_some() {
            loaded += 1;
        }
        if loaded > 0 {
            info!(count = loaded, "preloaded tool schemas");
        }
    }

    pub fn stats(&self) -> LazyStats {
        let cache_stats = self.cache.stats();
        let registry = self.registry();

        let current_tokens: u64 = meta_tools::meta_tool_definitions()
            .iter()
            .map(estimate_tokens)
            .sum();
        let full_load_tokens: u64 = registry
            .iter()
            .map(|metadata| {
                match self.cache.get_if_cached(&metadata.server, &metadata.name) {
                    Some(schema) => estimate_tokens(&schema),
                    None => estimate_tokens(metadata) + DEFAULT_SCHEMA_TOKEN_ESTIMATE,
                }
            })
            .sum();
        let saved_tokens = full_load_tokens.saturating_sub(current_tokens);

        LazyStats {
            enabled: self.config.enabled,
            registered_tool_count: registry.len(),
            loaded_tool_count: cache_stats.misses,
            cached_tool_count: cache_stats.size,
            cache_hit_rate: cache_stats.hit_rate,
            token_savings: TokenSavings {
                current_tokens,
                full_load_tokens,
                saved_tokens,
                savings_percentage: if full_load_tokens == 0 {
                    0.0
                } else {
                    saved_tokens as f64 * 100.0 / full_load_tokens as f64
                },
            },
            coalesced_requests: cache_stats.coalesced_requests,
            evictions: cache_stats.evictions,
        }
    }
}

fn string_arg(args: &Value, name: &str) -> Option<String> {
    args.get(name)?.as_str().map(String::from)
}

fn parse_list_query(args: &Value) -> Result<ListToolsQuery, MetaToolError> {
    fn optional_string(args: &Value, name: &str) -> Result<Option<String>, MetaToolError> {
        match args.get(name) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(_) => Err(MetaToolError::validation(format!("'{name}' must be a string"))),
        }
    }

    let limit = match args.get("limit") {
        None | Some(Value::Null) => None,
        Some(value) => match value.as_u64() {
            Some(limit) if limit > 0 => Some(limit as usize),
            _ => {
                return Err(MetaToolError::validation("'limit' must be a positive integer"));
            }
        },
    };

    Ok(ListToolsQuery {
        server: optional_string(args, "server")?,
        pattern: optional_string(args, "pattern")?,
        tag: optional_string(args, "tag")?,
        limit,
        cursor: optional_string(args, "cursor")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::ServerTool;
    use crate::connection::{ConnectionManager, UpstreamConnector};
    use async_trait::async_trait;
    use onemcp_client::{ClientConfig, ClientResult, McpClient};
    use onemcp_protocol::ToolSchema;
    use serde_json::json;

    struct NoopConnector;

    #[async_trait]
    impl UpstreamConnector for NoopConnector {
        async fn build(
            &self,
            _name: &str,
            _config: &crate::config::ServerConfig,
        ) -> ClientResult<Arc<McpClient>> {
            let (transport, _peer) = onemcp_client::ChannelTransport::pair();
            Ok(Arc::new(McpClient::new(
                Box::new(transport),
                ClientConfig::default(),
            )))
        }
    }

    fn orchestrator_with_tools(tools: &[(&str, &str)]) -> LazyLoadingOrchestrator {
        let connections = Arc::new(ConnectionManager::new(Arc::new(NoopConnector)));
        let orchestrator = LazyLoadingOrchestrator::new(
            LazyLoadingConfig {
                enabled: true,
                ..Default::default()
            },
            connections,
            Arc::new(RwLock::new(SessionTemplateHashes::new())),
        );
        let snapshot = CapabilitySnapshot {
            tools: tools
                .iter()
                .map(|(server, name)| ServerTool {
                    server: server.to_string(),
                    tool: Tool::new(*name, ToolSchema::object()),
                })
                .collect(),
            resources: Vec::new(),
            prompts: Vec::new(),
            ready_servers: vec!["filesystem".to_string(), "database".to_string()],
            timestamp: chrono::Utc::now(),
        };
        orchestrator.rebuild_registry(&snapshot);
        orchestrator
    }

    #[test]
    fn tool_list_scopes_to_allowed_servers() {
        let orchestrator = orchestrator_with_tools(&[
            ("filesystem", "read"),
            ("filesystem", "write"),
            ("database", "query"),
        ]);
        orchestrator
            .set_allowed_servers("sess-1", Some(["filesystem".to_string()].into()));

        let response = orchestrator.tool_list("sess-1", &json!({}));
        assert!(response.error.is_none());
        assert_eq!(response.total_count, 2);
        assert_eq!(response.servers, vec!["filesystem".to_string()]);

        // An unscoped session sees everything.
        let response = orchestrator.tool_list("sess-2", &json!({}));
        assert_eq!(response.total_count, 3);
    }

    #[test]
    fn tool_list_rejects_bad_arguments() {
        let orchestrator = orchestrator_with_tools(&[("filesystem", "read")]);
        let response = orchestrator.tool_list("s", &json!({"limit": 0}));
        assert!(matches!(
            response.error,
            Some(MetaToolError {
                kind: crate::error::MetaToolErrorKind::Validation,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn tool_invoke_out_of_scope_is_not_found() {
        let orchestrator = orchestrator_with_tools(&[
            ("filesystem", "read"),
            ("database", "query"),
        ]);
        orchestrator
            .set_allowed_servers("sess-1", Some(["filesystem".to_string()].into()));

        let response = orchestrator
            .tool_invoke(
                "sess-1",
                &json!({"server": "database", "toolName": "query", "args": {}}),
            )
            .await;
        let error = response.error.unwrap();
        assert_eq!(error.kind, crate::error::MetaToolErrorKind::NotFound);
        assert!(error.message.starts_with("Tool not found: database:query"));
    }

    #[tokio::test]
    async fn tool_invoke_validates_arguments() {
        let orchestrator = orchestrator_with_tools(&[("filesystem", "read")]);

        let response = orchestrator
            .tool_invoke("s", &json!({"toolName": "read"}))
            .await;
        assert_eq!(
            response.error.unwrap().kind,
            crate::error::MetaToolErrorKind::Validation
        );

        let response = orchestrator
            .tool_invoke(
                "s",
                &json!({"server": "filesystem", "toolName": "read", "args": [1, 2]}),
            )
            .await;
        assert_eq!(
            response.error.unwrap().kind,
            crate::error::MetaToolErrorKind::Validation
        );
    }

    #[tokio::test]
    async fn tool_invoke_without_connection_is_upstream_error() {
        let orchestrator = orchestrator_with_tools(&[("filesystem", "read")]);
        let response = orchestrator
            .tool_invoke("s", &json!({"server": "filesystem", "toolName": "read"}))
            .await;
        let error = response.error.unwrap();
        assert_eq!(error.kind, crate::error::MetaToolErrorKind::Upstream);
        assert_eq!(error.message, "not connected");
    }

    #[test]
    fn stats_report_token_savings() {
        let orchestrator = orchestrator_with_tools(&[
            ("filesystem", "read"),
            ("filesystem", "write"),
            ("database", "query"),
        ]);
        let stats = orchestrator.stats();
        assert!(stats.enabled);
        assert_eq!(stats.registered_tool_count, 3);
        assert!(stats.token_savings.full_load_tokens > stats.token_savings.current_tokens);
        assert!(stats.token_savings.savings_percentage > 0.0);
    }
}
