//! # 1MCP aggregation gateway
//!
//! One inbound MCP client connects to the gateway; the gateway maintains
//! outbound connections to many MCP servers and presents their tools,
//! resources and prompts as one unified surface.
//!
//! The core subsystems:
//!
//! - [`connection`]: outbound connection lifecycle and the keyed
//!   connections map that routing reads.
//! - [`aggregator`]: the merged capability snapshot with per-server
//!   filters, deduplication and change detection, plus the instructions
//!   preamble.
//! - [`filtering`]: per-session tag filtering (literal sets, simple OR, or
//!   a boolean expression).
//! - [`template`]: template server rendering and the shared client
//!   instance pool.
//! - [`lazy`]: the tool registry, schema cache and the three meta-tools
//!   (`tool_list`, `tool_schema`, `tool_invoke`).
//! - [`routing`] and [`handlers`]: the composite name scheme and the
//!   per-verb request handlers.
//! - [`server`]: assembly plus the stdio serve loop.

pub mod aggregator;
pub mod config;
pub mod connection;
pub mod context;
pub mod error;
pub mod factory;
pub mod filtering;
pub mod handlers;
pub mod internal;
pub mod lazy;
pub mod routing;
pub mod server;
pub mod session;
pub mod template;

pub use aggregator::{CapabilityAggregator, CapabilitySnapshot, ChangeSet, InstructionAggregator};
pub use config::{
    LazyLoadingConfig, PoolConfig, ProxyConfig, ServerConfig, SessionConfig, TagFilterMode,
    TemplateOptions, TransportConfig,
};
pub use connection::{
    CapabilityFilters, ConnectionManager, ConnectionStatus, OutboundConnection, StartupErrors,
    UpstreamConnector,
};
pub use context::SessionContext;
pub use error::{MetaToolError, MetaToolErrorKind, ProxyError, ProxyResult};
pub use filtering::{FilteringService, TagExpr};
pub use handlers::{RequestHandler, RequiredCapability};
pub use internal::{EmptyInternalTools, InternalToolProvider};
pub use lazy::{
    LazyLoadingOrchestrator, LazyStats, SchemaCache, SchemaCacheStats, ToolMetadata, ToolRegistry,
};
pub use routing::{build_uri, parse_uri, INTERNAL_SERVER_NAME, NAME_SEPARATOR};
pub use server::{InboundRequestForwarder, McpProxy};
pub use session::{InboundSession, SessionRegistry};
pub use template::{ClientInstancePool, InstanceStatus, PooledInstance};
