//! The aggregated capabilities snapshot and its refresh algorithm.
//!
//! `update_capabilities` fans out to every `Connected` upstream, applies the
//! per-server enable/disable filters, merges with first-writer-wins
//! deduplication in connection sort order, and diffs against the previous
//! snapshot. Snapshots are replaced atomically; readers never observe a
//! partial merge.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock, Weak};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use onemcp_protocol::{Prompt, Resource, Tool};

use crate::connection::{ConnectionManager, OutboundConnection};

/// A tool attributed to the server (base name) that provides it.
#[derive(Debug, Clone)]
pub struct ServerTool {
    pub server: String,
    pub tool: Tool,
}

/// A resource attributed to its server.
#[derive(Debug, Clone)]
pub struct ServerResource {
    pub server: String,
    pub resource: Resource,
}

/// A prompt attributed to its server.
#[derive(Debug, Clone)]
pub struct ServerPrompt {
    pub server: String,
    pub prompt: Prompt,
}

/// Point-in-time merged view of every connected upstream.
#[derive(Debug, Clone)]
pub struct CapabilitySnapshot {
    pub tools: Vec<ServerTool>,
    pub resources: Vec<ServerResource>,
    pub prompts: Vec<ServerPrompt>,
    /// Connection keys visited by the last refresh, list success or not.
    pub ready_servers: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl CapabilitySnapshot {
    pub fn empty() -> Self {
        Self {
            tools: Vec::new(),
            resources: Vec::new(),
            prompts: Vec::new(),
            ready_servers: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    fn tool_names(&self) -> HashSet<&str> {
        self.tools.iter().map(|t| t.tool.name.as_str()).collect()
    }

    fn resource_uris(&self) -> HashSet<&str> {
        self.resources
            .iter()
            .map(|r| r.resource.uri.as_str())
            .collect()
    }

    fn prompt_names(&self) -> HashSet<&str> {
        self.prompts.iter().map(|p| p.prompt.name.as_str()).collect()
    }
}

/// Outcome of one `update_capabilities` pass.
#[derive(Debug, Clone)]
pub struct ChangeSet {
    pub has_changes: bool,
    pub tools_changed: bool,
    pub resources_changed: bool,
    pub prompts_changed: bool,
    pub current: CapabilitySnapshot,
}

type Subscriber = Arc<dyn Fn(&ChangeSet) + Send + Sync>;

/// Disposer for a change subscription; unsubscribes on drop.
pub struct Subscription {
    id: u64,
    subscribers: Weak<StdMutex<BTreeMap<u64, Subscriber>>>,
}

impl Subscription {
    pub fn dispose(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(subscribers) = self.subscribers.upgrade() {
            subscribers
                .lock()
                .expect("subscribers lock poisoned")
                .remove(&self.id);
        }
    }
}

struct ServerFetch {
    tools: Vec<Tool>,
    resources: Vec<Resource>,
    prompts: Vec<Prompt>,
}

/// Maintains the aggregated capabilities snapshot.
pub struct CapabilityAggregator {
    connections: Arc<ConnectionManager>,
    current: RwLock<CapabilitySnapshot>,
    subscribers: Arc<StdMutex<BTreeMap<u64, Subscriber>>>,
    next_subscriber_id: AtomicU64,
}

impl CapabilityAggregator {
    pub fn new(connections: Arc<ConnectionManager>) -> Self {
        Self {
            connections,
            current: RwLock::new(CapabilitySnapshot::empty()),
            subscribers: Arc::new(StdMutex::new(BTreeMap::new())),
            next_subscriber_id: AtomicU64::new(0),
        }
    }

    /// Subscribe to change sets. Subscribers run synchronously after a
    /// refresh that produced changes; dropping the returned handle
    /// unsubscribes.
    pub fn subscribe(&self, subscriber: Subscriber) -> Subscription {
        let id = self.next_subscriber_id.fetch_add(1, Ordering::SeqCst);
        self.subscribers
            .lock()
            .expect("subscribers lock poisoned")
            .insert(id, subscriber);
        Subscription {
            id,
            subscribers: Arc::downgrade(&self.subscribers),
        }
    }

    pub fn get_current_capabilities(&self) -> CapabilitySnapshot {
        self.current
            .read()
            .expect("snapshot lock poisoned")
            .clone()
    }

    /// Refresh and return the new snapshot.
    pub async fn refresh_capabilities(&self) -> CapabilitySnapshot {
        self.update_capabilities().await.current
    }

    /// Refresh the snapshot and report what changed.
    pub async fn update_capabilities(&self) -> ChangeSet {
        let connections = self.connections.connected_sorted();

        let mut join_set = JoinSet::new();
        for connection in &connections {
            let connection = connection.clone();
            join_set.spawn(async move {
                let fetch = fetch_server_capabilities(&connection).await;
                (connection.key().to_string(), connection, fetch)
            });
        }

        // Keyed collection restores connection sort order after the
        // unordered join.
        let mut fetched: BTreeMap<String, (Arc<OutboundConnection>, ServerFetch)> = BTreeMap::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((key, connection, fetch)) => {
                    fetched.insert(key, (connection, fetch));
                }
                Err(e) => warn!("task panic while aggregating capabilities: {e}"),
            }
        }

        let mut tools = Vec::new();
        let mut resources = Vec::new();
        let mut prompts = Vec::new();
        let mut seen_tools = HashSet::new();
        let mut seen_uris = HashSet::new();
        let mut seen_prompts = HashSet::new();
        let mut ready_servers = Vec::new();

        for (key, (connection, fetch)) in &fetched {
            ready_servers.push(key.clone());
            let server = connection.base_name().to_string();

            for tool in &fetch.tools {
                if !connection.filters.allows_tool(&tool.name) {
                    continue;
                }
                if !seen_tools.insert(tool.name.clone()) {
                    debug!(server, tool = %tool.name, "dropping duplicate tool name");
                    continue;
                }
                tools.push(ServerTool {
                    server: server.clone(),
                    tool: tool.clone(),
                });
            }

            for resource in &fetch.resources {
                if !connection.filters.allows_resource(&resource.uri) {
                    continue;
                }
                if !seen_uris.insert(resource.uri.clone()) {
                    continue;
                }
                resources.push(ServerResource {
                    server: server.clone(),
                    resource: resource.clone(),
                });
            }

            for prompt in &fetch.prompts {
                if !connection.filters.allows_prompt(&prompt.name) {
                    continue;
                }
                if !seen_prompts.insert(prompt.name.clone()) {
                    continue;
                }
                prompts.push(ServerPrompt {
                    server: server.clone(),
                    prompt: prompt.clone(),
                });
            }
        }

        let snapshot = CapabilitySnapshot {
            tools,
            resources,
            prompts,
            ready_servers,
            timestamp: Utc::now(),
        };

        let change_set = {
            let mut current = self.current.write().expect("snapshot lock poisoned");
            let tools_changed = current.tool_names() != snapshot.tool_names();
            let resources_changed = current.resource_uris() != snapshot.resource_uris();
            let prompts_changed = current.prompt_names() != snapshot.prompt_names();
            *current = snapshot.clone();
            ChangeSet {
                has_changes: tools_changed || resources_changed || prompts_changed,
                tools_changed,
                resources_changed,
                prompts_changed,
                current: snapshot,
            }
        };

        if change_set.has_changes {
            info!(
                tools = change_set.current.tools.len(),
                resources = change_set.current.resources.len(),
                prompts = change_set.current.prompts.len(),
                servers = change_set.current.ready_servers.len(),
                "aggregated capabilities changed"
            );
            let subscribers: Vec<Subscriber> = self
                .subscribers
                .lock()
                .expect("subscribers lock poisoned")
                .values()
                .cloned()
                .collect();
            for subscriber in subscribers {
                subscriber(&change_set);
            }
        }

        change_set
    }

    /// Human-readable one-liner about the current snapshot.
    pub fn get_capabilities_summary(&self) -> String {
        let snapshot = self.get_current_capabilities();
        format!(
            "{} tools, {} resources, {} prompts across {} ready server(s), updated {}",
            snapshot.tools.len(),
            snapshot.resources.len(),
            snapshot.prompts.len(),
            snapshot.ready_servers.len(),
            snapshot.timestamp.to_rfc3339()
        )
    }
}

/// Fetch the three capability lists from one upstream, paginating each to
/// exhaustion. Failures are confined per capability: the failing list comes
/// back empty and the server still counts as ready.
async fn fetch_server_capabilities(connection: &Arc<OutboundConnection>) -> ServerFetch {
    let capabilities = connection.capabilities().unwrap_or_default();
    let key = connection.key();

    let tools = if capabilities.has_tools() {
        let mut collected = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            match connection.client.list_tools(cursor.clone()).await {
                Ok(page) => {
                    collected.extend(page.tools);
                    match page.next_cursor {
                        Some(next) if Some(&next) != cursor.as_ref() => cursor = Some(next),
                        Some(_) => {
                            warn!(server = %key, "tools/list repeated its cursor, stopping");
                            break;
                        }
                        None => break,
                    }
                }
                Err(e) => {
                    warn!(server = %key, "tools/list failed, treating as empty: {e}");
                    collected.clear();
                    break;
                }
            }
        }
        collected
    } else {
        Vec::new()
    };

    let resources = if capabilities.has_resources() {
        let mut collected = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            match connection.client.list_resources(cursor.clone()).await {
                Ok(page) => {
                    collected.extend(page.resources);
                    match page.next_cursor {
                        Some(next) if Some(&next) != cursor.as_ref() => cursor = Some(next),
                        Some(_) => {
                            warn!(server = %key, "resources/list repeated its cursor, stopping");
                            break;
                        }
                        None => break,
                    }
                }
                Err(e) => {
                    warn!(server = %key, "resources/list failed, treating as empty: {e}");
                    collected.clear();
                    break;
                }
            }
        }
        collected
    } else {
        Vec::new()
    };

    let prompts = if capabilities.has_prompts() {
        let mut collected = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            match connection.client.list_prompts(cursor.clone()).await {
                Ok(page) => {
                    collected.extend(page.prompts);
                    match page.next_cursor {
                        Some(next) if Some(&next) != cursor.as_ref() => cursor = Some(next),
                        Some(_) => {
                            warn!(server = %key, "prompts/list repeated its cursor, stopping");
                            break;
                        }
                        None => break,
                    }
                }
                Err(e) => {
                    warn!(server = %key, "prompts/list failed, treating as empty: {e}");
                    collected.clear();
                    break;
                }
            }
        }
        collected
    } else {
        Vec::new()
    };

    ServerFetch {
        tools,
        resources,
        prompts,
    }
}
