//! Streamable HTTP transport: JSON-RPC over POST with `Mcp-Session-Id`
//! session tracking.

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;
use url::Url;

use onemcp_protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};

use crate::error::{ClientResult, TransportError};
use crate::transport::{EventReceiver, Transport, TransportKind};

const MCP_SESSION_ID_HEADER: &str = "Mcp-Session-Id";

/// Configuration for a streamable HTTP server.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub url: Url,
    pub headers: HashMap<String, String>,
    pub request_timeout: Duration,
}

impl HttpConfig {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            headers: HashMap::new(),
            request_timeout: Duration::from_secs(60),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// Transport over streamable HTTP.
///
/// Server-initiated traffic arrives on the optional GET event stream in the
/// full protocol; this transport covers the POST request/response half the
/// gateway needs for upstream calls, so its event receiver only ever reports
/// lifecycle events.
pub struct HttpTransport {
    config: HttpConfig,
    client: reqwest::Client,
    session_id: Option<String>,
    connected: bool,
    events: Option<EventReceiver>,
    events_tx: tokio::sync::mpsc::UnboundedSender<crate::transport::TransportEvent>,
}

impl HttpTransport {
    pub fn new(config: HttpConfig) -> Self {
        let (events_tx, events_rx) = tokio::sync::mpsc::unbounded_channel();
        Self {
            client: reqwest::Client::new(),
            config,
            session_id: None,
            connected: false,
            events: Some(events_rx),
            events_tx,
        }
    }

    fn request_builder(&self, body: &impl serde::Serialize) -> ClientResult<reqwest::RequestBuilder> {
        let mut builder = self
            .client
            .post(self.config.url.clone())
            .header("Content-Type", "application/json")
            .header("Accept", "application/json")
            .json(body);
        for (name, value) in &self.config.headers {
            builder = builder.header(name, value);
        }
        if let Some(session_id) = &self.session_id {
            builder = builder.header(MCP_SESSION_ID_HEADER, session_id);
        }
        Ok(builder)
    }

    fn capture_session_id(&mut self, response: &reqwest::Response) {
        if let Some(session_id) = response
            .headers()
            .get(MCP_SESSION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            if self.session_id.as_deref() != Some(session_id) {
                debug!(session_id, "captured upstream session id");
                self.session_id = Some(session_id.to_string());
            }
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }

    async fn start(&mut self) -> ClientResult<()> {
        // Connections are per-request; "started" just arms the transport.
        self.connected = true;
        Ok(())
    }

    async fn send_request(&mut self, request: JsonRpcRequest) -> ClientResult<JsonRpcResponse> {
        if !self.connected {
            return Err(TransportError::NotStarted.into());
        }
        let response = self
            .request_builder(&request)?
            .send()
            .await
            .map_err(TransportError::Http)?;
        self.capture_session_id(&response);

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::HttpStatus(status.as_u16()).into());
        }

        let body: JsonRpcResponse = response.json().await.map_err(TransportError::Http)?;
        Ok(body)
    }

    async fn send_notification(&mut self, notification: JsonRpcNotification) -> ClientResult<()> {
        if !self.connected {
            return Err(TransportError::NotStarted.into());
        }
        let response = self
            .request_builder(&notification)?
            .send()
            .await
            .map_err(TransportError::Http)?;
        self.capture_session_id(&response);

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::HttpStatus(status.as_u16()).into());
        }
        Ok(())
    }

    async fn send_response(&mut self, response: JsonRpcResponse) -> ClientResult<()> {
        if !self.connected {
            return Err(TransportError::NotStarted.into());
        }
        let http_response = self
            .request_builder(&response)?
            .send()
            .await
            .map_err(TransportError::Http)?;
        let status = http_response.status();
        if !status.is_success() {
            return Err(TransportError::HttpStatus(status.as_u16()).into());
        }
        Ok(())
    }

    async fn close(&mut self) -> ClientResult<()> {
        if let Some(session_id) = self.session_id.take() {
            // Best effort: ask the server to drop the session.
            let result = self
                .client
                .delete(self.config.url.clone())
                .header(MCP_SESSION_ID_HEADER, &session_id)
                .send()
                .await;
            if let Err(e) = result {
                debug!(session_id, "session DELETE failed: {e}");
            }
        }
        self.connected = false;
        let _ = self.events_tx.send(crate::transport::TransportEvent::Closed);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn request_timeout(&self) -> Duration {
        self.config.request_timeout
    }

    fn take_event_receiver(&mut self) -> Option<EventReceiver> {
        self.events.take()
    }
}
