//! Protocol version negotiation.

/// The MCP protocol version the gateway offers and prefers.
pub const MCP_VERSION: &str = "2025-06-18";

/// Protocol versions the gateway accepts from peers, newest first.
pub const SUPPORTED_VERSIONS: &[&str] = &["2025-06-18", "2025-03-26", "2024-11-05"];

/// Whether the given version can be negotiated.
pub fn is_supported(version: &str) -> bool {
    SUPPORTED_VERSIONS.contains(&version)
}

/// Pick the version to answer with: echo the peer's version when we support
/// it, otherwise offer our own and let the peer decide.
pub fn negotiate(requested: &str) -> &'static str {
    SUPPORTED_VERSIONS
        .iter()
        .find(|v| **v == requested)
        .copied()
        .unwrap_or(MCP_VERSION)
}
