//! Convenience re-exports for client consumers.

pub use crate::client::{McpClient, ServerRequestHandler};
pub use crate::config::{ClientConfig, TimeoutConfig};
pub use crate::error::{ClientError, ClientResult, TransportError};
pub use crate::transport::{
    BoxedTransport, ChannelTransport, EventReceiver, HttpTransport, StdioTransport, Transport,
    TransportEvent, TransportKind,
};
