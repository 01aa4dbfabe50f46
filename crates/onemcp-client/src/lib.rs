//! # Outbound MCP client for the 1MCP gateway
//!
//! One [`McpClient`] per upstream server, over a pluggable [`Transport`]:
//! stdio subprocess, streamable HTTP, or the in-memory channel pair used by
//! tests. The gateway's connection manager owns many of these.

pub mod client;
pub mod config;
pub mod error;
pub mod prelude;
pub mod transport;

pub use client::{CloseHandler, McpClient, NotificationHandler, ServerRequestHandler};
pub use config::{ClientConfig, TimeoutConfig};
pub use error::{ClientError, ClientResult, TransportError};
pub use transport::{
    BoxedTransport, ChannelPeer, ChannelTransport, EventReceiver, HttpTransport, StdioTransport,
    Transport, TransportEvent, TransportKind,
};
pub use transport::http::HttpConfig;
pub use transport::stdio::StdioConfig;
