//! Transport layer for the outbound client.
//!
//! A transport carries JSON-RPC messages to one upstream server. The client
//! and the gateway core treat transports as opaque: `start`, `send_request`,
//! `send_notification`, `close`, an event receiver for server-initiated
//! traffic, and an inspectable `request_timeout` used to derive per-request
//! deadlines.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use onemcp_protocol::{JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, RequestId};

use crate::error::{ClientResult, TransportError};

pub mod channel;
pub mod http;
pub mod stdio;

pub use channel::{ChannelPeer, ChannelTransport};
pub use http::HttpTransport;
pub use stdio::StdioTransport;

/// Transport kind, for logging and factory selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Stdio,
    Http,
    Channel,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Stdio => write!(f, "stdio"),
            TransportKind::Http => write!(f, "http"),
            TransportKind::Channel => write!(f, "channel"),
        }
    }
}

/// Server-initiated traffic and lifecycle events.
#[derive(Debug)]
pub enum TransportEvent {
    /// The server sent a request that expects a response
    Request(JsonRpcRequest),
    /// The server sent a notification
    Notification(JsonRpcNotification),
    /// The connection closed
    Closed,
    /// The transport hit an unrecoverable error
    Error(String),
}

/// Receiver for [`TransportEvent`]s.
pub type EventReceiver = tokio::sync::mpsc::UnboundedReceiver<TransportEvent>;

/// Transport trait implemented by stdio, streamable HTTP and the in-memory
/// channel transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Transport kind
    fn kind(&self) -> TransportKind;

    /// Establish the connection (spawn the process, open the endpoint)
    async fn start(&mut self) -> ClientResult<()>;

    /// Send a request and wait for the matching response
    async fn send_request(&mut self, request: JsonRpcRequest) -> ClientResult<JsonRpcResponse>;

    /// Send a notification (no response expected)
    async fn send_notification(&mut self, notification: JsonRpcNotification) -> ClientResult<()>;

    /// Send a response to a server-initiated request
    async fn send_response(&mut self, response: JsonRpcResponse) -> ClientResult<()>;

    /// Close the connection and release resources
    async fn close(&mut self) -> ClientResult<()>;

    /// Whether the transport is currently usable
    fn is_connected(&self) -> bool;

    /// Per-request deadline the owner should apply to calls on this transport
    fn request_timeout(&self) -> Duration;

    /// Take the event receiver. Yields `None` after the first call.
    fn take_event_receiver(&mut self) -> Option<EventReceiver>;
}

/// Type alias for a boxed transport.
pub type BoxedTransport = Box<dyn Transport>;

/// Map of requests awaiting a response, shared between the writer half and
/// the reader task of a bidirectional transport.
pub(crate) type PendingMap = Arc<Mutex<HashMap<RequestId, tokio::sync::oneshot::Sender<JsonRpcResponse>>>>;

/// Route one incoming message: responses complete their pending request,
/// everything else goes to the event channel.
pub(crate) fn dispatch_incoming(
    message: JsonRpcMessage,
    pending: &PendingMap,
    events: &tokio::sync::mpsc::UnboundedSender<TransportEvent>,
) {
    match message {
        JsonRpcMessage::Response(response) => {
            let sender = pending
                .lock()
                .expect("pending map lock poisoned")
                .remove(&response.id);
            match sender {
                Some(sender) => {
                    let _ = sender.send(response);
                }
                None => {
                    tracing::warn!(id = %response.id, "response for unknown request id");
                }
            }
        }
        JsonRpcMessage::Request(request) => {
            let _ = events.send(TransportEvent::Request(request));
        }
        JsonRpcMessage::Notification(notification) => {
            let _ = events.send(TransportEvent::Notification(notification));
        }
    }
}

/// Register a pending request and return the receiver for its response.
pub(crate) fn register_pending(
    pending: &PendingMap,
    id: RequestId,
) -> tokio::sync::oneshot::Receiver<JsonRpcResponse> {
    let (tx, rx) = tokio::sync::oneshot::channel();
    pending
        .lock()
        .expect("pending map lock poisoned")
        .insert(id, tx);
    rx
}

/// Fail every pending request. Used when the peer goes away.
pub(crate) fn drain_pending(pending: &PendingMap) {
    pending
        .lock()
        .expect("pending map lock poisoned")
        .clear();
}

/// Await a registered response, converting a dropped sender into `Closed`.
pub(crate) async fn await_response(
    rx: tokio::sync::oneshot::Receiver<JsonRpcResponse>,
) -> ClientResult<JsonRpcResponse> {
    rx.await.map_err(|_| TransportError::Closed.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use onemcp_protocol::JsonRpcResponse;
    use serde_json::json;

    #[tokio::test]
    async fn dispatch_routes_response_to_pending() {
        let pending: PendingMap = Default::default();
        let (events_tx, mut events_rx) = tokio::sync::mpsc::unbounded_channel();

        let rx = register_pending(&pending, RequestId::Number(1));
        dispatch_incoming(
            JsonRpcMessage::Response(JsonRpcResponse::success(
                RequestId::Number(1),
                json!({"ok": true}),
            )),
            &pending,
            &events_tx,
        );

        let response = await_response(rx).await.unwrap();
        assert_eq!(response.result.unwrap()["ok"], true);
        assert!(events_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn dispatch_routes_notification_to_events() {
        let pending: PendingMap = Default::default();
        let (events_tx, mut events_rx) = tokio::sync::mpsc::unbounded_channel();

        dispatch_incoming(
            JsonRpcMessage::Notification(JsonRpcNotification::new(
                "notifications/tools/list_changed",
                None,
            )),
            &pending,
            &events_tx,
        );

        assert!(matches!(
            events_rx.try_recv().unwrap(),
            TransportEvent::Notification(_)
        ));
    }
}
