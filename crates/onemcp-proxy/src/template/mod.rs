//! Template servers: rendering definitions against session context and
//! pooling the resulting upstream instances.

pub mod pool;
pub mod renderer;

pub use pool::{ClientInstancePool, InstanceStatus, PoolError, PooledInstance, SessionTemplateHashes};
pub use renderer::{extract_placeholders, render_value, rendered_hash, TemplateError};
