//! Lazy loading: the tool registry, schema cache, and meta-tool layer that
//! collapse thousands of upstream tools into three stable entry points.

pub mod cache;
pub mod meta_tools;
pub mod orchestrator;
pub mod registry;

pub use cache::{SchemaCache, SchemaCacheError, SchemaCacheStats};
pub use meta_tools::{
    is_meta_tool, meta_tool_definitions, ToolInvokeResponse, ToolListResponse, ToolSchemaResponse,
    META_TOOL_INVOKE, META_TOOL_LIST, META_TOOL_SCHEMA,
};
pub use orchestrator::{FilteredCapabilities, LazyLoadingOrchestrator, LazyStats, TokenSavings};
pub use registry::{ListToolsQuery, RegistryError, ToolListPage, ToolMetadata, ToolRegistry};
