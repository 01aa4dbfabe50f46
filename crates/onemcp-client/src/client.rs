//! The outbound MCP client.
//!
//! One `McpClient` owns one transport to one upstream server. The gateway
//! creates many of these, so the client keeps no global state: everything is
//! per-instance, and all methods take `&self` so the connection manager can
//! share clients behind `Arc`.

use serde_json::Value;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use async_trait::async_trait;
use onemcp_protocol::{
    methods, notifications, CallToolParams, CallToolResult, CompleteParams, CompleteResult,
    EmptyResult, ErrorObject, GetPromptParams, GetPromptResult, InitializeParams, InitializeResult,
    JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, ListPromptsParams, ListPromptsResult,
    ListResourceTemplatesResult, ListResourcesParams, ListResourcesResult, ListToolsParams,
    ListToolsResult, ReadResourceParams, ReadResourceResult, RequestId, ServerCapabilities,
    SubscribeParams, UnsubscribeParams,
};

use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};
use crate::transport::{BoxedTransport, TransportEvent};

/// Handler for server-initiated requests (sampling, elicitation, roots).
///
/// The gateway registers one of these per upstream, and only for the
/// capabilities the inbound client actually advertises.
#[async_trait]
pub trait ServerRequestHandler: Send + Sync {
    async fn handle_request(&self, request: JsonRpcRequest) -> Result<Value, ErrorObject>;
}

/// Callback invoked for each server notification.
pub type NotificationHandler = Arc<dyn Fn(JsonRpcNotification) + Send + Sync>;

/// Callback invoked once when the transport closes or errors out.
pub type CloseHandler = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct EventHandlers {
    request: Option<Arc<dyn ServerRequestHandler>>,
    notification: Option<NotificationHandler>,
    close: Option<CloseHandler>,
}

/// MCP client over a single transport.
pub struct McpClient {
    transport: Arc<tokio::sync::Mutex<BoxedTransport>>,
    config: ClientConfig,
    request_counter: AtomicI64,
    initialize_result: RwLock<Option<InitializeResult>>,
    handlers: Arc<StdMutex<EventHandlers>>,
    event_task: StdMutex<Option<tokio::task::JoinHandle<()>>>,
}

impl McpClient {
    pub fn new(transport: BoxedTransport, config: ClientConfig) -> Self {
        Self {
            transport: Arc::new(tokio::sync::Mutex::new(transport)),
            config,
            request_counter: AtomicI64::new(0),
            initialize_result: RwLock::new(None),
            handlers: Arc::new(StdMutex::new(EventHandlers::default())),
            event_task: StdMutex::new(None),
        }
    }

    /// Register the handler for server-initiated requests. Must be called
    /// before [`connect`](Self::connect) for events not to be dropped.
    pub fn set_request_handler(&self, handler: Arc<dyn ServerRequestHandler>) {
        self.handlers
            .lock()
            .expect("handlers lock poisoned")
            .request = Some(handler);
    }

    /// Register the handler for server notifications.
    pub fn set_notification_handler(&self, handler: NotificationHandler) {
        self.handlers
            .lock()
            .expect("handlers lock poisoned")
            .notification = Some(handler);
    }

    /// Register the close callback.
    pub fn set_close_handler(&self, handler: CloseHandler) {
        self.handlers.lock().expect("handlers lock poisoned").close = Some(handler);
    }

    /// Start the transport and run the initialize handshake.
    pub async fn connect(&self) -> ClientResult<()> {
        let events = {
            let mut transport = self.transport.lock().await;
            transport.start().await?;
            transport.take_event_receiver()
        };

        if let Some(events) = events {
            self.spawn_event_loop(events);
        }

        self.initialize().await?;
        info!(client = %self.config.client_info.name, "connected to MCP server");
        Ok(())
    }

    async fn initialize(&self) -> ClientResult<()> {
        let params = InitializeParams::new(self.config.client_info.clone())
            .with_capabilities(self.config.capabilities.clone());
        let init_deadline = self.config.timeouts.initialization;

        let raw = timeout(
            init_deadline,
            self.request_inner(methods::INITIALIZE, Some(serde_json::to_value(&params)?)),
        )
        .await
        .map_err(|_| ClientError::Timeout(init_deadline))??;

        let result: InitializeResult = serde_json::from_value(raw)
            .map_err(|e| ClientError::Initialize(format!("malformed initialize result: {e}")))?;

        if !onemcp_protocol::version::is_supported(&result.protocol_version) {
            warn!(
                version = %result.protocol_version,
                "server negotiated an unknown protocol version; continuing"
            );
        }

        *self
            .initialize_result
            .write()
            .expect("initialize_result lock poisoned") = Some(result);

        self.notify(notifications::initialized()).await?;
        Ok(())
    }

    fn spawn_event_loop(&self, mut events: crate::transport::EventReceiver) {
        let transport = self.transport.clone();
        let handlers = self.handlers.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    TransportEvent::Request(request) => {
                        let handler = handlers
                            .lock()
                            .expect("handlers lock poisoned")
                            .request
                            .clone();
                        let id = request.id.clone();
                        let response = match handler {
                            Some(handler) => match handler.handle_request(request).await {
                                Ok(result) => JsonRpcResponse::success(id, result),
                                Err(error) => JsonRpcResponse::error(id, error),
                            },
                            None => JsonRpcResponse::error(
                                id,
                                ErrorObject::new(
                                    onemcp_protocol::json_rpc::METHOD_NOT_FOUND,
                                    "no handler registered for server-initiated requests",
                                ),
                            ),
                        };
                        let mut transport = transport.lock().await;
                        if let Err(e) = transport.send_response(response).await {
                            warn!("failed to answer server-initiated request: {e}");
                        }
                    }
                    TransportEvent::Notification(notification) => {
                        let handler = handlers
                            .lock()
                            .expect("handlers lock poisoned")
                            .notification
                            .clone();
                        if let Some(handler) = handler {
                            handler(notification);
                        } else {
                            debug!(method = %notification.method, "dropping unhandled notification");
                        }
                    }
                    TransportEvent::Closed | TransportEvent::Error(_) => {
                        let handler = handlers
                            .lock()
                            .expect("handlers lock poisoned")
                            .close
                            .clone();
                        if let Some(handler) = handler {
                            handler();
                        }
                        break;
                    }
                }
            }
        });
        *self.event_task.lock().expect("event_task lock poisoned") = Some(task);
    }

    fn next_id(&self) -> RequestId {
        RequestId::Number(self.request_counter.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Send a request, applying the transport-derived per-request deadline.
    async fn request_inner(&self, method: &str, params: Option<Value>) -> ClientResult<Value> {
        let request = JsonRpcRequest::new(self.next_id(), method, params);
        let mut transport = self.transport.lock().await;
        let deadline = transport.request_timeout();

        let response = timeout(deadline, transport.send_request(request))
            .await
            .map_err(|_| ClientError::Timeout(deadline))??;

        if let Some(error) = response.error {
            return Err(ClientError::rpc(error));
        }
        Ok(response.result.unwrap_or(Value::Null))
    }

    async fn request<P, R>(&self, method: &str, params: Option<&P>) -> ClientResult<R>
    where
        P: serde::Serialize,
        R: serde::de::DeserializeOwned,
    {
        let params = params.map(serde_json::to_value).transpose()?;
        let raw = self.request_inner(method, params).await?;
        Ok(serde_json::from_value(raw)?)
    }

    async fn notify(&self, notification: JsonRpcNotification) -> ClientResult<()> {
        let mut transport = self.transport.lock().await;
        transport.send_notification(notification).await
    }

    /// The result of the initialize handshake, once connected.
    pub fn initialize_result(&self) -> Option<InitializeResult> {
        self.initialize_result
            .read()
            .expect("initialize_result lock poisoned")
            .clone()
    }

    /// Capabilities advertised by the upstream server.
    pub fn server_capabilities(&self) -> Option<ServerCapabilities> {
        self.initialize_result().map(|r| r.capabilities)
    }

    /// Free-form instructions supplied by the upstream server.
    pub fn instructions(&self) -> Option<String> {
        self.initialize_result().and_then(|r| r.instructions)
    }

    /// Per-request deadline derived from the transport.
    pub async fn request_timeout(&self) -> Duration {
        self.transport.lock().await.request_timeout()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialize_result
            .read()
            .expect("initialize_result lock poisoned")
            .is_some()
    }

    // --- Typed verb methods ---

    pub async fn list_tools(&self, cursor: Option<String>) -> ClientResult<ListToolsResult> {
        let params = ListToolsParams { cursor };
        self.request(methods::TOOLS_LIST, Some(&params)).await
    }

    pub async fn call_tool(
        &self,
        name: impl Into<String>,
        arguments: Option<Value>,
    ) -> ClientResult<CallToolResult> {
        let params = CallToolParams::new(name, arguments);
        self.request(methods::TOOLS_CALL, Some(&params)).await
    }

    pub async fn list_resources(&self, cursor: Option<String>) -> ClientResult<ListResourcesResult> {
        let params = ListResourcesParams { cursor };
        self.request(methods::RESOURCES_LIST, Some(&params)).await
    }

    pub async fn list_resource_templates(
        &self,
        cursor: Option<String>,
    ) -> ClientResult<ListResourceTemplatesResult> {
        let params = ListResourcesParams { cursor };
        self.request(methods::RESOURCES_TEMPLATES_LIST, Some(&params))
            .await
    }

    pub async fn read_resource(&self, uri: impl Into<String>) -> ClientResult<ReadResourceResult> {
        let params = ReadResourceParams::new(uri);
        self.request(methods::RESOURCES_READ, Some(&params)).await
    }

    pub async fn subscribe(&self, uri: impl Into<String>) -> ClientResult<EmptyResult> {
        let params = SubscribeParams { uri: uri.into() };
        self.request(methods::RESOURCES_SUBSCRIBE, Some(&params))
            .await
    }

    pub async fn unsubscribe(&self, uri: impl Into<String>) -> ClientResult<EmptyResult> {
        let params = UnsubscribeParams { uri: uri.into() };
        self.request(methods::RESOURCES_UNSUBSCRIBE, Some(&params))
            .await
    }

    pub async fn list_prompts(&self, cursor: Option<String>) -> ClientResult<ListPromptsResult> {
        let params = ListPromptsParams { cursor };
        self.request(methods::PROMPTS_LIST, Some(&params)).await
    }

    pub async fn get_prompt(&self, params: GetPromptParams) -> ClientResult<GetPromptResult> {
        self.request(methods::PROMPTS_GET, Some(&params)).await
    }

    pub async fn complete(&self, params: CompleteParams) -> ClientResult<CompleteResult> {
        self.request(methods::COMPLETION_COMPLETE, Some(&params))
            .await
    }

    pub async fn ping(&self) -> ClientResult<EmptyResult> {
        self.request::<(), EmptyResult>(methods::PING, None).await
    }

    /// Close the transport and stop the event loop.
    pub async fn close(&self) -> ClientResult<()> {
        if let Some(task) = self
            .event_task
            .lock()
            .expect("event_task lock poisoned")
            .take()
        {
            task.abort();
        }
        let mut transport = self.transport.lock().await;
        transport.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ChannelTransport;
    use onemcp_protocol::{JsonRpcMessage, MCP_VERSION};
    use serde_json::json;

    fn initialize_response(id: RequestId) -> JsonRpcResponse {
        JsonRpcResponse::success(
            id,
            json!({
                "protocolVersion": MCP_VERSION,
                "capabilities": {"tools": {"listChanged": true}},
                "serverInfo": {"name": "mock", "version": "1.0.0"},
                "instructions": "mock server instructions"
            }),
        )
    }

    /// Drive the peer side: answer initialize, then run `f` per request.
    fn spawn_mock_server<F>(mut peer: crate::transport::ChannelPeer, f: F) -> tokio::task::JoinHandle<()>
    where
        F: Fn(&JsonRpcRequest) -> Value + Send + 'static,
    {
        tokio::spawn(async move {
            while let Some(request) = peer.next_request().await {
                let id = request.id.clone();
                if request.method == methods::INITIALIZE {
                    let _ = peer
                        .outgoing
                        .send(JsonRpcMessage::Response(initialize_response(id)));
                } else {
                    peer.respond(id, f(&request));
                }
            }
        })
    }

    #[tokio::test]
    async fn connect_runs_handshake() {
        let (transport, peer) = ChannelTransport::pair();
        let _server = spawn_mock_server(peer, |_| json!({}));

        let client = McpClient::new(Box::new(transport), ClientConfig::default());
        client.connect().await.unwrap();

        assert!(client.is_initialized());
        assert_eq!(
            client.instructions().as_deref(),
            Some("mock server instructions")
        );
        assert!(client.server_capabilities().unwrap().has_tools());
    }

    #[tokio::test]
    async fn list_tools_parses_result() {
        let (transport, peer) = ChannelTransport::pair();
        let _server = spawn_mock_server(peer, |request| match request.method.as_str() {
            "tools/list" => json!({
                "tools": [{"name": "echo", "inputSchema": {"type": "object"}}]
            }),
            _ => json!({}),
        });

        let client = McpClient::new(Box::new(transport), ClientConfig::default());
        client.connect().await.unwrap();

        let result = client.list_tools(None).await.unwrap();
        assert_eq!(result.tools.len(), 1);
        assert_eq!(result.tools[0].name, "echo");
    }

    #[tokio::test]
    async fn rpc_error_is_surfaced() {
        let (transport, mut peer) = ChannelTransport::pair();
        let _server = tokio::spawn(async move {
            while let Some(request) = peer.next_request().await {
                let id = request.id.clone();
                if request.method == methods::INITIALIZE {
                    let _ = peer
                        .outgoing
                        .send(JsonRpcMessage::Response(initialize_response(id)));
                } else {
                    peer.respond_error(id, ErrorObject::new(-32601, "nope"));
                }
            }
        });

        let client = McpClient::new(Box::new(transport), ClientConfig::default());
        client.connect().await.unwrap();

        match client.ping().await {
            Err(ClientError::Rpc { code, .. }) => assert_eq!(code, -32601),
            other => panic!("expected rpc error, got {other:?}"),
        }
    }
}
