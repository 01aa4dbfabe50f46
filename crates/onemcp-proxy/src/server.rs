//! Gateway assembly and the inbound serve loop.
//!
//! [`McpProxy`] wires the connection manager, aggregators, instance pool,
//! lazy orchestrator and request handler together, dispatches inbound
//! JSON-RPC requests by method, and serves a single inbound session over
//! stdio.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};
use uuid::Uuid;

use onemcp_protocol::{
    methods, notifications, CompleteParams, ErrorObject, GetPromptParams, Implementation,
    InitializeParams, InitializeResult, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, ListChangedCapability, McpError, RequestId, ResourcesCapability,
    ServerCapabilities,
};

use crate::aggregator::{CapabilityAggregator, InstructionAggregator, Subscription};
use crate::config::{ProxyConfig, SessionConfig};
use crate::connection::{ConnectionManager, StartupErrors, UpstreamConnector};
use crate::context::SessionContext;
use crate::error::ProxyResult;
use crate::factory::TransportConnector;
use crate::filtering::FilteringService;
use crate::handlers::{RequestHandler, RequiredCapability};
use crate::internal::{EmptyInternalTools, InternalToolProvider};
use crate::lazy::LazyLoadingOrchestrator;
use crate::session::{InboundSession, SessionRegistry};
use crate::template::ClientInstancePool;

/// Forwards a server-initiated upstream request to the inbound client.
#[async_trait]
pub trait InboundRequestForwarder: Send + Sync {
    async fn forward(&self, request: JsonRpcRequest) -> Result<Value, ErrorObject>;
}

type SharedForwarder = Arc<RwLock<Option<Arc<dyn InboundRequestForwarder>>>>;

/// The aggregation gateway.
pub struct McpProxy {
    config: Arc<ProxyConfig>,
    connections: Arc<ConnectionManager>,
    aggregator: Arc<CapabilityAggregator>,
    pool: Arc<ClientInstancePool>,
    lazy: Arc<LazyLoadingOrchestrator>,
    sessions: Arc<SessionRegistry>,
    handler: Arc<RequestHandler>,
    forwarder: SharedForwarder,
    _registry_subscription: Subscription,
}

impl McpProxy {
    /// Start with real transports.
    pub async fn start(config: ProxyConfig) -> ProxyResult<(Arc<Self>, StartupErrors)> {
        Self::start_with(config, Arc::new(TransportConnector::new()), Arc::new(EmptyInternalTools)).await
    }

    /// Start with an injected connector and internal tools provider.
    pub async fn start_with(
        config: ProxyConfig,
        connector: Arc<dyn UpstreamConnector>,
        internal: Arc<dyn InternalToolProvider>,
    ) -> ProxyResult<(Arc<Self>, StartupErrors)> {
        config.validate()?;
        let config = Arc::new(config);

        let connections = Arc::new(ConnectionManager::new(connector));
        let errors = connections.start_configured(&config.servers).await;

        let pool = Arc::new(ClientInstancePool::new(
            config.pool.clone(),
            connections.clone(),
        ));
        pool.start_cleanup_task();

        let aggregator = Arc::new(CapabilityAggregator::new(connections.clone()));
        let lazy = Arc::new(LazyLoadingOrchestrator::new(
            config.lazy_loading.clone(),
            connections.clone(),
            pool.session_hashes(),
        ));

        // Keep the lazy registry in lockstep with the snapshot.
        let registry_subscription = {
            let lazy = lazy.clone();
            aggregator.subscribe(Arc::new(move |change| {
                lazy.rebuild_registry(&change.current);
            }))
        };

        aggregator.update_capabilities().await;
        if lazy.enabled() {
            lazy.preload().await;
        }

        let sessions = Arc::new(SessionRegistry::new());
        let filtering = Arc::new(FilteringService::new(config.presets.clone()));
        let handler = Arc::new(RequestHandler::new(
            config.clone(),
            connections.clone(),
            aggregator.clone(),
            Arc::new(InstructionAggregator::new()),
            filtering,
            lazy.clone(),
            internal,
            sessions.clone(),
            pool.session_hashes(),
        ));

        let proxy = Arc::new(Self {
            config,
            connections,
            aggregator,
            pool,
            lazy,
            sessions,
            handler,
            forwarder: Arc::new(RwLock::new(None)),
            _registry_subscription: registry_subscription,
        });

        proxy.install_upstream_hooks();
        Ok((proxy, errors))
    }

    /// Install per-upstream notification refresh and conditional
    /// server-request forwarding.
    fn install_upstream_hooks(self: &Arc<Self>) {
        let (refresh_tx, mut refresh_rx) = tokio::sync::mpsc::unbounded_channel::<()>();

        for connection in self.connections.snapshot().values() {
            let refresh = refresh_tx.clone();
            connection.client.set_notification_handler(Arc::new(move |notification| {
                if matches!(
                    notification.method.as_str(),
                    methods::NOTIFICATION_TOOLS_LIST_CHANGED
                        | methods::NOTIFICATION_RESOURCES_LIST_CHANGED
                        | methods::NOTIFICATION_PROMPTS_LIST_CHANGED
                ) {
                    let _ = refresh.send(());
                }
            }));

            let forwarded = forwardable_methods(connection.capabilities().as_ref());
            if !forwarded.is_empty() {
                connection.client.set_request_handler(Arc::new(UpstreamRequestHandler {
                    allowed: forwarded,
                    forwarder: self.forwarder.clone(),
                }));
            }
        }

        let proxy = Arc::downgrade(self);
        tokio::spawn(async move {
            while refresh_rx.recv().await.is_some() {
                // Drain bursts into one refresh.
                while refresh_rx.try_recv().is_ok() {}
                let Some(proxy) = proxy.upgrade() else { break };
                proxy.aggregator.update_capabilities().await;
            }
        });
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    pub fn aggregator(&self) -> &Arc<CapabilityAggregator> {
        &self.aggregator
    }

    pub fn pool(&self) -> &Arc<ClientInstancePool> {
        &self.pool
    }

    pub fn lazy(&self) -> &Arc<LazyLoadingOrchestrator> {
        &self.lazy
    }

    pub fn handler(&self) -> &Arc<RequestHandler> {
        &self.handler
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    /// Register the inbound forwarder used for server-initiated requests.
    pub fn set_inbound_forwarder(&self, forwarder: Arc<dyn InboundRequestForwarder>) {
        *self.forwarder.write().expect("forwarder lock poisoned") = Some(forwarder);
    }

    /// Create an inbound session: register it, materialise the template
    /// servers its context renders, and refresh the snapshot.
    pub async fn create_session(
        &self,
        context: SessionContext,
        session_config: Option<SessionConfig>,
    ) -> ProxyResult<Arc<InboundSession>> {
        let session_config = session_config.unwrap_or_else(|| self.config.session.clone());
        let session = self.sessions.create(context.clone(), session_config);

        for (name, server_config) in &self.config.servers {
            if !server_config.is_template() {
                continue;
            }
            match self
                .pool
                .get_or_create_client_instance(name, server_config, &context, &context.session_id)
                .await
            {
                Ok(instance) => {
                    debug!(template = name, key = %instance.key, "template instance ready");
                }
                Err(e) => {
                    warn!(template = name, "failed to materialise template instance: {e}");
                }
            }
        }

        self.aggregator.update_capabilities().await;

        // A tag-filtered session gets its meta-tool surface scoped to the
        // servers it can see.
        if self.lazy.enabled() {
            let session_cfg = self.sessions.config_for(session.session_id(), &self.config.session);
            let filtered = !matches!(
                session_cfg.tag_filter_mode,
                crate::config::TagFilterMode::None
            ) || session_cfg.preset_name.is_some();
            if filtered {
                let allowed: HashSet<String> = self
                    .handler
                    .effective_connections_for(session.session_id(), RequiredCapability::Any)
                    .iter()
                    .map(|c| c.base_name().to_string())
                    .collect();
                self.lazy
                    .set_allowed_servers(session.session_id(), Some(allowed));
            }
        }

        info!(session_id = %session.session_id(), "inbound session created");
        Ok(session)
    }

    /// Tear down an inbound session.
    pub async fn close_session(&self, session_id: &str) {
        self.sessions.remove(session_id);
        self.pool.detach_session(session_id).await;
        self.lazy.remove_session(session_id);
        info!(session_id, "inbound session closed");
    }

    /// Answer the inbound initialize request for `session_id`, creating the
    /// session on first contact.
    pub async fn handle_initialize(
        &self,
        session_id: &str,
        params: InitializeParams,
    ) -> ProxyResult<InitializeResult> {
        if self.sessions.get(session_id).is_none() {
            self.create_session(SessionContext::new(session_id), None)
                .await?;
        }

        let negotiated = onemcp_protocol::version::negotiate(&params.protocol_version);
        let lazy = self.lazy.enabled();
        let capabilities = ServerCapabilities {
            tools: Some(ListChangedCapability {
                // Change notifications for tools are suppressed in lazy mode:
                // the meta-tool surface is stable by construction.
                list_changed: Some(!lazy),
            }),
            resources: Some(ResourcesCapability {
                subscribe: Some(true),
                list_changed: Some(true),
            }),
            prompts: Some(ListChangedCapability::list_changed()),
            completions: Some(serde_json::json!({})),
            ..Default::default()
        };

        let mut result = InitializeResult::new(
            Implementation::new("onemcp-proxy", env!("CARGO_PKG_VERSION"))
                .with_title("1MCP Gateway"),
            capabilities,
        )
        .with_instructions(self.handler.instructions_for_session(session_id));
        result.protocol_version = negotiated.to_string();
        Ok(result)
    }

    /// Dispatch one inbound request for a session.
    pub async fn dispatch(&self, session_id: &str, request: JsonRpcRequest) -> JsonRpcResponse {
        let id = request.id.clone();
        match self.dispatch_inner(session_id, request).await {
            Ok(result) => JsonRpcResponse::success(id, result),
            Err(e) => {
                debug!(session_id, "request failed: {e}");
                JsonRpcResponse::error(id, e.to_error_object())
            }
        }
    }

    async fn dispatch_inner(
        &self,
        session_id: &str,
        request: JsonRpcRequest,
    ) -> ProxyResult<Value> {
        let params = request.params.unwrap_or(Value::Null);

        fn cursor_of(params: &Value) -> Option<String> {
            params.get("cursor").and_then(Value::as_str).map(String::from)
        }

        fn require_str(params: &Value, field: &str) -> ProxyResult<String> {
            params
                .get(field)
                .and_then(Value::as_str)
                .map(String::from)
                .ok_or_else(|| McpError::invalid_params(format!("missing '{field}'")).into())
        }

        let result = match request.method.as_str() {
            methods::INITIALIZE => {
                let params: InitializeParams = serde_json::from_value(params)
                    .map_err(|e| McpError::invalid_params(e.to_string()))?;
                serde_json::to_value(self.handle_initialize(session_id, params).await?)?
            }
            methods::PING => serde_json::to_value(self.handler.ping(session_id).await?)?,
            methods::TOOLS_LIST => serde_json::to_value(
                self.handler
                    .list_tools(session_id, cursor_of(&params))
                    .await?,
            )?,
            methods::TOOLS_CALL => {
                let name = require_str(&params, "name")?;
                let arguments = params.get("arguments").cloned();
                serde_json::to_value(
                    self.handler
                        .call_tool(session_id, &name, arguments)
                        .await?,
                )?
            }
            methods::RESOURCES_LIST => serde_json::to_value(
                self.handler
                    .list_resources(session_id, cursor_of(&params))
                    .await?,
            )?,
            methods::RESOURCES_TEMPLATES_LIST => serde_json::to_value(
                self.handler
                    .list_resource_templates(session_id, cursor_of(&params))
                    .await?,
            )?,
            methods::RESOURCES_READ => {
                let uri = require_str(&params, "uri")?;
                serde_json::to_value(self.handler.read_resource(session_id, &uri).await?)?
            }
            methods::RESOURCES_SUBSCRIBE => {
                let uri = require_str(&params, "uri")?;
                serde_json::to_value(self.handler.subscribe(session_id, &uri).await?)?
            }
            methods::RESOURCES_UNSUBSCRIBE => {
                let uri = require_str(&params, "uri")?;
                serde_json::to_value(self.handler.unsubscribe(session_id, &uri).await?)?
            }
            methods::PROMPTS_LIST => serde_json::to_value(
                self.handler
                    .list_prompts(session_id, cursor_of(&params))
                    .await?,
            )?,
            methods::PROMPTS_GET => {
                let params: GetPromptParams = serde_json::from_value(params)
                    .map_err(|e| McpError::invalid_params(e.to_string()))?;
                serde_json::to_value(self.handler.get_prompt(session_id, params).await?)?
            }
            methods::COMPLETION_COMPLETE => {
                let params: CompleteParams = serde_json::from_value(params)
                    .map_err(|e| McpError::invalid_params(e.to_string()))?;
                serde_json::to_value(self.handler.complete(session_id, params).await?)?
            }
            other => return Err(McpError::MethodNotFound(other.to_string()).into()),
        };
        Ok(result)
    }

    /// Serve one inbound session over stdio, newline-delimited JSON-RPC.
    /// Returns when stdin reaches EOF.
    pub async fn serve_stdio(self: &Arc<Self>) -> ProxyResult<()> {
        let session_id = Uuid::new_v4().to_string();
        info!(session_id, "serving inbound session on stdio");

        let (out_tx, mut out_rx) = tokio::sync::mpsc::unbounded_channel::<String>();
        let writer = tokio::spawn(async move {
            let mut stdout = tokio::io::stdout();
            while let Some(line) = out_rx.recv().await {
                if stdout.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                if stdout.write_all(b"\n").await.is_err() {
                    break;
                }
                let _ = stdout.flush().await;
            }
        });

        // Change notifications flow to the inbound client except for the
        // tool surface in lazy mode.
        let lazy_mode = self.lazy.enabled();
        let notify_tx = out_tx.clone();
        let _change_subscription = self.aggregator.subscribe(Arc::new(move |change| {
            let mut pending: Vec<JsonRpcNotification> = Vec::new();
            if change.tools_changed && !lazy_mode {
                pending.push(notifications::tools_list_changed());
            }
            if change.resources_changed {
                pending.push(notifications::resources_list_changed());
            }
            if change.prompts_changed {
                pending.push(notifications::prompts_list_changed());
            }
            for notification in pending {
                if let Ok(line) = serde_json::to_string(&notification) {
                    let _ = notify_tx.send(line);
                }
            }
        }));

        let forwarder = Arc::new(StdioForwarder {
            out: out_tx.clone(),
            pending: Arc::new(StdMutex::new(HashMap::new())),
            counter: AtomicI64::new(0),
        });
        self.set_inbound_forwarder(forwarder.clone());

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            match JsonRpcMessage::from_str(&line) {
                Ok(JsonRpcMessage::Request(request)) => {
                    let response = self.dispatch(&session_id, request).await;
                    match serde_json::to_string(&response) {
                        Ok(line) => {
                            let _ = out_tx.send(line);
                        }
                        Err(e) => warn!("failed to serialize response: {e}"),
                    }
                }
                Ok(JsonRpcMessage::Notification(notification)) => {
                    debug!(method = %notification.method, "inbound notification");
                }
                Ok(JsonRpcMessage::Response(response)) => {
                    forwarder.complete(response);
                }
                Err(e) => warn!("discarding unparseable inbound line: {e}"),
            }
        }

        self.close_session(&session_id).await;
        drop(out_tx);
        let _ = writer.await;
        Ok(())
    }

    /// Close everything: instance pool, then every outbound connection.
    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
        self.connections.shutdown().await;
        info!("gateway shut down");
    }
}

/// Forwarder that writes server-initiated requests to the inbound stdio
/// stream and correlates the responses.
struct StdioForwarder {
    out: tokio::sync::mpsc::UnboundedSender<String>,
    pending: Arc<StdMutex<HashMap<RequestId, tokio::sync::oneshot::Sender<JsonRpcResponse>>>>,
    counter: AtomicI64,
}

impl StdioForwarder {
    fn complete(&self, response: JsonRpcResponse) {
        let sender = self
            .pending
            .lock()
            .expect("pending forwards poisoned")
            .remove(&response.id);
        match sender {
            Some(sender) => {
                let _ = sender.send(response);
            }
            None => debug!(id = %response.id, "inbound response for unknown request"),
        }
    }
}

#[async_trait]
impl InboundRequestForwarder for StdioForwarder {
    async fn forward(&self, mut request: JsonRpcRequest) -> Result<Value, ErrorObject> {
        let id = RequestId::String(format!(
            "srv-{}",
            self.counter.fetch_add(1, Ordering::SeqCst) + 1
        ));
        request.id = id.clone();

        let (tx, rx) = tokio::sync::oneshot::channel();
        self.pending
            .lock()
            .expect("pending forwards poisoned")
            .insert(id.clone(), tx);

        let line = serde_json::to_string(&request).map_err(|e| {
            ErrorObject::new(
                onemcp_protocol::json_rpc::INTERNAL_ERROR,
                format!("cannot serialize forwarded request: {e}"),
            )
        })?;
        if self.out.send(line).is_err() {
            self.pending
                .lock()
                .expect("pending forwards poisoned")
                .remove(&id);
            return Err(ErrorObject::new(
                onemcp_protocol::json_rpc::INTERNAL_ERROR,
                "inbound client disconnected",
            ));
        }

        match rx.await {
            Ok(response) => match response.error {
                Some(error) => Err(error),
                None => Ok(response.result.unwrap_or(Value::Null)),
            },
            Err(_) => Err(ErrorObject::new(
                onemcp_protocol::json_rpc::INTERNAL_ERROR,
                "inbound client disconnected",
            )),
        }
    }
}

/// Server-initiated methods forwardable for an upstream, derived from its
/// advertised capabilities.
fn forwardable_methods(capabilities: Option<&ServerCapabilities>) -> HashSet<String> {
    let mut methods_set = HashSet::new();
    let Some(capabilities) = capabilities else {
        return methods_set;
    };
    if let Some(experimental) = &capabilities.experimental {
        if experimental.contains_key("sampling") {
            methods_set.insert(methods::SAMPLING_CREATE_MESSAGE.to_string());
        }
        if experimental.contains_key("elicitation") {
            methods_set.insert(methods::ELICITATION_CREATE.to_string());
        }
        if experimental.contains_key("roots") {
            methods_set.insert(methods::ROOTS_LIST.to_string());
        }
    }
    methods_set
}

/// Per-upstream handler routing allowed server-initiated requests to the
/// inbound forwarder.
struct UpstreamRequestHandler {
    allowed: HashSet<String>,
    forwarder: SharedForwarder,
}

#[async_trait]
impl onemcp_client::ServerRequestHandler for UpstreamRequestHandler {
    async fn handle_request(&self, request: JsonRpcRequest) -> Result<Value, ErrorObject> {
        if !self.allowed.contains(&request.method) {
            return Err(ErrorObject::new(
                onemcp_protocol::json_rpc::METHOD_NOT_FOUND,
                format!("method '{}' is not forwardable", request.method),
            ));
        }
        let forwarder = self
            .forwarder
            .read()
            .expect("forwarder lock poisoned")
            .clone();
        match forwarder {
            Some(forwarder) => forwarder.forward(request).await,
            None => Err(ErrorObject::new(
                onemcp_protocol::json_rpc::INTERNAL_ERROR,
                "no inbound client attached",
            )),
        }
    }
}

