//! Session-scoped connection resolution.
//!
//! A composite name's server part is always a base name; the concrete map
//! key depends on the session: per-client template instances live under
//! `name:{sessionId}`, shareable ones under `name:{renderedHash}` (reachable
//! only through the session's hash registry), static servers under the bare
//! name.

use std::collections::HashMap;
use std::sync::Arc;

use crate::connection::OutboundConnection;
use crate::template::SessionTemplateHashes;

/// Resolve `name` for `session_id`, in order: per-client template instance,
/// shareable template instance, static server.
pub fn resolve_outbound_connection(
    name: &str,
    session_id: &str,
    connections: &HashMap<String, Arc<OutboundConnection>>,
    session_hashes: &SessionTemplateHashes,
) -> Option<Arc<OutboundConnection>> {
    let per_client_key = format!("{name}:{session_id}");
    if let Some(connection) = connections.get(&per_client_key) {
        return Some(connection.clone());
    }

    if let Some(hash) = session_hashes
        .get(session_id)
        .and_then(|templates| templates.get(name))
    {
        let shareable_key = format!("{name}:{hash}");
        if let Some(connection) = connections.get(&shareable_key) {
            return Some(connection.clone());
        }
    }

    connections.get(name).cloned()
}

/// The subset of connections a session may see: static servers, its own
/// per-client instances, and the shareable instances its hash registry
/// points at.
pub fn filter_connections_for_session(
    connections: &HashMap<String, Arc<OutboundConnection>>,
    session_id: &str,
    session_hashes: &SessionTemplateHashes,
) -> Vec<Arc<OutboundConnection>> {
    let templates = session_hashes.get(session_id);
    let mut visible: Vec<Arc<OutboundConnection>> = connections
        .iter()
        .filter(|(key, _)| match key.split_once(':') {
            None => true,
            Some((name, suffix)) => {
                suffix == session_id
                    || templates
                        .and_then(|t| t.get(name))
                        .is_some_and(|hash| hash == suffix)
            }
        })
        .map(|(_, connection)| connection.clone())
        .collect();
    visible.sort_by(|a, b| a.key().cmp(b.key()));
    visible
}
