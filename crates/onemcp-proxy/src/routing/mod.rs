//! Request routing: the composite URI scheme, session-scoped connection
//! resolution, and fan-out pagination.

pub mod pagination;
pub mod resolve;
pub mod uri;

pub use pagination::{paginate, PageFetch};
pub use resolve::{filter_connections_for_session, resolve_outbound_connection};
pub use uri::{build_uri, parse_uri, ParsedUri, INTERNAL_SERVER_NAME, NAME_SEPARATOR};
