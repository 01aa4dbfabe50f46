//! In-memory channel transport for tests.
//!
//! [`ChannelTransport::pair`] yields the client half plus a [`ChannelPeer`]
//! that a test drives as the "server": read requests off `incoming`, push
//! responses (or server-initiated requests) into `outgoing`.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use onemcp_protocol::{JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};

use crate::error::{ClientResult, TransportError};
use crate::transport::{
    await_response, dispatch_incoming, drain_pending, register_pending, EventReceiver, PendingMap,
    Transport, TransportEvent, TransportKind,
};

/// The far end of a [`ChannelTransport`], held by test code.
pub struct ChannelPeer {
    /// Messages the client sent
    pub incoming: tokio::sync::mpsc::UnboundedReceiver<JsonRpcMessage>,
    /// Messages to deliver to the client
    pub outgoing: tokio::sync::mpsc::UnboundedSender<JsonRpcMessage>,
}

impl ChannelPeer {
    /// Convenience: receive the next request, panicking on other traffic.
    pub async fn next_request(&mut self) -> Option<JsonRpcRequest> {
        loop {
            match self.incoming.recv().await? {
                JsonRpcMessage::Request(request) => return Some(request),
                JsonRpcMessage::Notification(_) => continue,
                other => panic!("unexpected message from client: {other:?}"),
            }
        }
    }

    /// Send a success response for the given request id.
    pub fn respond(&self, id: onemcp_protocol::RequestId, result: serde_json::Value) {
        let _ = self
            .outgoing
            .send(JsonRpcMessage::Response(JsonRpcResponse::success(id, result)));
    }

    /// Send an error response for the given request id.
    pub fn respond_error(&self, id: onemcp_protocol::RequestId, error: onemcp_protocol::ErrorObject) {
        let _ = self
            .outgoing
            .send(JsonRpcMessage::Response(JsonRpcResponse::error(id, error)));
    }
}

/// Paired in-memory transport.
pub struct ChannelTransport {
    to_peer: tokio::sync::mpsc::UnboundedSender<JsonRpcMessage>,
    from_peer: Option<tokio::sync::mpsc::UnboundedReceiver<JsonRpcMessage>>,
    pending: PendingMap,
    connected: Arc<AtomicBool>,
    events: Option<EventReceiver>,
    router_task: Option<tokio::task::JoinHandle<()>>,
    request_timeout: Duration,
}

impl ChannelTransport {
    /// Create a connected transport/peer pair.
    pub fn pair() -> (Self, ChannelPeer) {
        Self::pair_with_timeout(Duration::from_secs(5))
    }

    /// Create a pair with an explicit per-request timeout.
    pub fn pair_with_timeout(request_timeout: Duration) -> (Self, ChannelPeer) {
        let (to_peer, peer_incoming) = tokio::sync::mpsc::unbounded_channel();
        let (peer_outgoing, from_peer) = tokio::sync::mpsc::unbounded_channel();
        (
            Self {
                to_peer,
                from_peer: Some(from_peer),
                pending: PendingMap::default(),
                connected: Arc::new(AtomicBool::new(false)),
                events: None,
                router_task: None,
                request_timeout,
            },
            ChannelPeer {
                incoming: peer_incoming,
                outgoing: peer_outgoing,
            },
        )
    }

    fn send_to_peer(&self, message: JsonRpcMessage) -> ClientResult<()> {
        self.to_peer
            .send(message)
            .map_err(|_| TransportError::Closed.into())
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Channel
    }

    async fn start(&mut self) -> ClientResult<()> {
        let mut from_peer = self
            .from_peer
            .take()
            .ok_or(TransportError::NotStarted)?;
        let (events_tx, events_rx) = tokio::sync::mpsc::unbounded_channel();
        self.events = Some(events_rx);
        self.connected.store(true, Ordering::SeqCst);

        let pending = self.pending.clone();
        let connected = self.connected.clone();
        self.router_task = Some(tokio::spawn(async move {
            while let Some(message) = from_peer.recv().await {
                dispatch_incoming(message, &pending, &events_tx);
            }
            connected.store(false, Ordering::SeqCst);
            drain_pending(&pending);
            let _ = events_tx.send(TransportEvent::Closed);
        }));
        Ok(())
    }

    async fn send_request(&mut self, request: JsonRpcRequest) -> ClientResult<JsonRpcResponse> {
        let rx = register_pending(&self.pending, request.id.clone());
        if let Err(e) = self.send_to_peer(JsonRpcMessage::Request(request.clone())) {
            self.pending
                .lock()
                .expect("pending map lock poisoned")
                .remove(&request.id);
            return Err(e);
        }
        await_response(rx).await
    }

    async fn send_notification(&mut self, notification: JsonRpcNotification) -> ClientResult<()> {
        self.send_to_peer(JsonRpcMessage::Notification(notification))
    }

    async fn send_response(&mut self, response: JsonRpcResponse) -> ClientResult<()> {
        self.send_to_peer(JsonRpcMessage::Response(response))
    }

    async fn close(&mut self) -> ClientResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(task) = self.router_task.take() {
            task.abort();
        }
        drain_pending(&self.pending);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    fn take_event_receiver(&mut self) -> Option<EventReceiver> {
        self.events.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn request_response_roundtrip() {
        let (mut transport, mut peer) = ChannelTransport::pair();
        transport.start().await.unwrap();

        let server = tokio::spawn(async move {
            let request = peer.next_request().await.unwrap();
            assert_eq!(request.method, "ping");
            peer.respond(request.id, json!({}));
        });

        let response = transport
            .send_request(JsonRpcRequest::new(1i64, "ping", None))
            .await
            .unwrap();
        assert!(response.error.is_none());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn peer_drop_fails_pending_request() {
        let (mut transport, peer) = ChannelTransport::pair();
        transport.start().await.unwrap();
        drop(peer);

        let result = transport
            .send_request(JsonRpcRequest::new(1i64, "ping", None))
            .await;
        assert!(result.is_err());
    }
}
