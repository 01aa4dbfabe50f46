//! Fan-out pagination over many upstream connections.
//!
//! With pagination disabled, every connection is called once and the mapped
//! items are concatenated. With pagination enabled, each connection keeps
//! its own upstream cursor; the composite cursor handed to the client is a
//! base64 JSON map `connectionKey -> upstreamCursor` that a follow-up call
//! decodes to continue exactly where each upstream left off.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures::future::BoxFuture;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::warn;

use onemcp_client::ClientError;
use onemcp_protocol::McpError;

use crate::connection::OutboundConnection;
use crate::error::ProxyResult;

/// Fetch one page from one connection: `(items, next_cursor)`. Items come
/// back already rewritten for the inbound boundary.
pub type PageFetch<T> = Arc<
    dyn Fn(
            Arc<OutboundConnection>,
            Option<String>,
        ) -> BoxFuture<'static, Result<(Vec<T>, Option<String>), ClientError>>
        + Send
        + Sync,
>;

fn encode_composite(cursors: &HashMap<String, String>) -> ProxyResult<String> {
    Ok(BASE64.encode(serde_json::to_vec(cursors)?))
}

fn decode_composite(cursor: &str) -> ProxyResult<HashMap<String, String>> {
    let raw = BASE64
        .decode(cursor)
        .map_err(|_| McpError::invalid_params("invalid pagination cursor"))?;
    serde_json::from_slice(&raw)
        .map_err(|_| McpError::invalid_params("invalid pagination cursor").into())
}

/// Fan out a list verb across `connections`, in connection-key sort order.
pub async fn paginate<T: Send + 'static>(
    connections: Vec<Arc<OutboundConnection>>,
    cursor: Option<String>,
    pagination_enabled: bool,
    fetch: PageFetch<T>,
) -> ProxyResult<(Vec<T>, Option<String>)> {
    let continuations: Option<HashMap<String, String>> = match (&cursor, pagination_enabled) {
        (Some(cursor), true) => Some(decode_composite(cursor)?),
        _ => None,
    };

    let mut join_set = JoinSet::new();
    for connection in connections {
        let key = connection.key().to_string();
        let upstream_cursor = match &continuations {
            // A follow-up call only continues connections that still had
            // pages outstanding.
            Some(map) => match map.get(&key) {
                Some(cursor) => Some(cursor.clone()),
                None => continue,
            },
            None => None,
        };
        let fetch = fetch.clone();
        join_set.spawn(async move {
            let result = fetch(connection, upstream_cursor).await;
            (key, result)
        });
    }

    let mut pages: BTreeMap<String, Vec<T>> = BTreeMap::new();
    let mut next_cursors: HashMap<String, String> = HashMap::new();

    while let Some(joined) = join_set.join_next().await {
        let (key, result) = match joined {
            Ok(pair) => pair,
            Err(e) => {
                warn!("task panic during list fan-out: {e}");
                continue;
            }
        };
        match result {
            Ok((items, next_cursor)) => {
                pages.insert(key.clone(), items);
                if pagination_enabled {
                    if let Some(next_cursor) = next_cursor {
                        next_cursors.insert(key, next_cursor);
                    }
                }
            }
            Err(e) => {
                warn!(connection = %key, "list fan-out failed, treating as empty: {e}");
            }
        }
    }

    let items: Vec<T> = pages.into_values().flatten().collect();
    let next_cursor = if next_cursors.is_empty() {
        None
    } else {
        Some(encode_composite(&next_cursors)?)
    };
    Ok((items, next_cursor))
}
