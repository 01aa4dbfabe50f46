//! Outbound connection lifecycle.
//!
//! The [`ConnectionManager`] owns one [`OutboundConnection`] per map key.
//! Keys follow the routing contract: `name` for static servers,
//! `name:<renderedHash>` for shareable template instances,
//! `name:<sessionId>` for per-client template instances. The manager is the
//! only structural mutator; readers work on cloned snapshots.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, Weak};
use tokio::task::JoinSet;
use tracing::{info, warn};

use onemcp_client::{ClientError, ClientResult, McpClient};
use onemcp_protocol::ServerCapabilities;

use crate::config::ServerConfig;

/// Lifecycle state of an outbound connection.
///
/// Only `Connected` connections participate in capability aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
    AwaitingOauth,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Error => "error",
            ConnectionStatus::AwaitingOauth => "awaiting-oauth",
        };
        write!(f, "{label}")
    }
}

/// Per-server enable/disable lists. A whitelist, when present, wins outright;
/// the blacklist is only consulted when no whitelist is configured.
#[derive(Debug, Clone, Default)]
pub struct CapabilityFilters {
    enabled_tools: Option<HashSet<String>>,
    disabled_tools: HashSet<String>,
    enabled_resources: Option<HashSet<String>>,
    disabled_resources: HashSet<String>,
    enabled_prompts: Option<HashSet<String>>,
    disabled_prompts: HashSet<String>,
}

impl CapabilityFilters {
    pub fn from_config(config: &ServerConfig) -> Self {
        fn to_set(list: &Option<Vec<String>>) -> Option<HashSet<String>> {
            list.as_ref().map(|l| l.iter().cloned().collect())
        }
        Self {
            enabled_tools: to_set(&config.enabled_tools),
            disabled_tools: to_set(&config.disabled_tools).unwrap_or_default(),
            enabled_resources: to_set(&config.enabled_resources),
            disabled_resources: to_set(&config.disabled_resources).unwrap_or_default(),
            enabled_prompts: to_set(&config.enabled_prompts),
            disabled_prompts: to_set(&config.disabled_prompts).unwrap_or_default(),
        }
    }

    fn allows(enabled: &Option<HashSet<String>>, disabled: &HashSet<String>, name: &str) -> bool {
        match enabled {
            Some(whitelist) => whitelist.contains(name),
            None => !disabled.contains(name),
        }
    }

    pub fn allows_tool(&self, name: &str) -> bool {
        Self::allows(&self.enabled_tools, &self.disabled_tools, name)
    }

    pub fn allows_resource(&self, uri: &str) -> bool {
        Self::allows(&self.enabled_resources, &self.disabled_resources, uri)
    }

    pub fn allows_prompt(&self, name: &str) -> bool {
        Self::allows(&self.enabled_prompts, &self.disabled_prompts, name)
    }
}

/// One upstream connection, keyed in the connections map.
pub struct OutboundConnection {
    key: String,
    base_name: String,
    pub config: ServerConfig,
    pub client: Arc<McpClient>,
    status: RwLock<ConnectionStatus>,
    last_connected: RwLock<Option<DateTime<Utc>>>,
    pub filters: CapabilityFilters,
}

impl OutboundConnection {
    pub fn new(key: impl Into<String>, config: ServerConfig, client: Arc<McpClient>) -> Self {
        let key = key.into();
        let base_name = key.split(':').next().unwrap_or(&key).to_string();
        let filters = CapabilityFilters::from_config(&config);
        Self {
            key,
            base_name,
            config,
            client,
            status: RwLock::new(ConnectionStatus::Disconnected),
            last_connected: RwLock::new(None),
            filters,
        }
    }

    /// Full map key, possibly carrying a `:suffix`.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Name before any `:suffix`; the routing prefix clients see.
    pub fn base_name(&self) -> &str {
        &self.base_name
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.read().expect("status lock poisoned")
    }

    pub fn set_status(&self, status: ConnectionStatus) {
        *self.status.write().expect("status lock poisoned") = status;
    }

    pub fn mark_connected(&self) {
        self.set_status(ConnectionStatus::Connected);
        *self
            .last_connected
            .write()
            .expect("last_connected lock poisoned") = Some(Utc::now());
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    pub fn last_connected(&self) -> Option<DateTime<Utc>> {
        *self
            .last_connected
            .read()
            .expect("last_connected lock poisoned")
    }

    pub fn tags(&self) -> &[String] {
        &self.config.tags
    }

    /// Instructions for this server: config override first, then whatever the
    /// upstream reported at initialize.
    pub fn instructions(&self) -> Option<String> {
        self.config
            .instructions
            .clone()
            .or_else(|| self.client.instructions())
    }

    pub fn capabilities(&self) -> Option<ServerCapabilities> {
        self.client.server_capabilities()
    }
}

impl std::fmt::Debug for OutboundConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundConnection")
            .field("key", &self.key)
            .field("status", &self.status())
            .finish()
    }
}

/// Builds (but does not connect) an upstream client for a server definition.
///
/// The split from `McpClient::connect` keeps construction cheap so the
/// manager can register a `Connecting` entry before any I/O happens, and it
/// is the seam tests use to substitute channel-backed clients.
#[async_trait]
pub trait UpstreamConnector: Send + Sync {
    async fn build(&self, name: &str, config: &ServerConfig) -> ClientResult<Arc<McpClient>>;
}

/// Startup failures per server name.
pub type StartupErrors = HashMap<String, ClientError>;

/// Owner of the outbound connections map.
pub struct ConnectionManager {
    connections: RwLock<HashMap<String, Arc<OutboundConnection>>>,
    connector: Arc<dyn UpstreamConnector>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn UpstreamConnector>) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            connector,
        }
    }

    pub fn connector(&self) -> Arc<dyn UpstreamConnector> {
        self.connector.clone()
    }

    /// Start every configured non-template server concurrently.
    ///
    /// Servers that fail to build or connect are reported in the returned
    /// map; failures never abort the rest of the fleet.
    pub async fn start_configured(
        &self,
        servers: &HashMap<String, ServerConfig>,
    ) -> StartupErrors {
        let mut errors = StartupErrors::new();
        let mut join_set = JoinSet::new();

        for (name, config) in servers {
            if config.is_template() {
                continue;
            }
            match self.connector.build(name, config).await {
                Ok(client) => {
                    let connection =
                        Arc::new(OutboundConnection::new(name.clone(), config.clone(), client));
                    connection.set_status(ConnectionStatus::Connecting);
                    self.insert(connection.clone());
                    join_set.spawn(async move {
                        let result = connection.client.connect().await;
                        (connection, result)
                    });
                }
                Err(e) => {
                    warn!(server = %name, "failed to build upstream client: {e}");
                    errors.insert(name.clone(), e);
                }
            }
        }

        while let Some(joined) = join_set.join_next().await {
            let (connection, result) = match joined {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("task panic while connecting an upstream server: {e}");
                    continue;
                }
            };
            match result {
                Ok(()) => {
                    Self::install_close_hook(&connection);
                    connection.mark_connected();
                    info!(server = %connection.key(), "upstream connected");
                }
                Err(e) => {
                    connection.set_status(ConnectionStatus::Error);
                    warn!(server = %connection.key(), "upstream connect failed: {e}");
                    errors.insert(connection.key().to_string(), e);
                }
            }
        }

        errors
    }

    fn install_close_hook(connection: &Arc<OutboundConnection>) {
        let weak: Weak<OutboundConnection> = Arc::downgrade(connection);
        connection.client.set_close_handler(Arc::new(move || {
            if let Some(connection) = weak.upgrade() {
                warn!(server = %connection.key(), "upstream transport closed");
                connection.set_status(ConnectionStatus::Disconnected);
            }
        }));
    }

    /// Rebuild and reconnect a known connection, replacing its map entry.
    pub async fn reconnect(&self, key: &str) -> ClientResult<()> {
        let existing = self
            .get(key)
            .ok_or_else(|| ClientError::Initialize(format!("unknown connection '{key}'")))?;

        let client = self
            .connector
            .build(existing.base_name(), &existing.config)
            .await?;
        let replacement = Arc::new(OutboundConnection::new(
            key.to_string(),
            existing.config.clone(),
            client,
        ));
        replacement.set_status(ConnectionStatus::Connecting);
        self.insert(replacement.clone());

        match replacement.client.connect().await {
            Ok(()) => {
                Self::install_close_hook(&replacement);
                replacement.mark_connected();
                let _ = existing.client.close().await;
                Ok(())
            }
            Err(e) => {
                replacement.set_status(ConnectionStatus::Error);
                Err(e)
            }
        }
    }

    pub fn insert(&self, connection: Arc<OutboundConnection>) {
        self.connections
            .write()
            .expect("connections lock poisoned")
            .insert(connection.key().to_string(), connection);
    }

    pub fn remove(&self, key: &str) -> Option<Arc<OutboundConnection>> {
        self.connections
            .write()
            .expect("connections lock poisoned")
            .remove(key)
    }

    pub fn get(&self, key: &str) -> Option<Arc<OutboundConnection>> {
        self.connections
            .read()
            .expect("connections lock poisoned")
            .get(key)
            .cloned()
    }

    /// Read-consistent snapshot of the whole map.
    pub fn snapshot(&self) -> HashMap<String, Arc<OutboundConnection>> {
        self.connections
            .read()
            .expect("connections lock poisoned")
            .clone()
    }

    /// All connections, sorted by key.
    pub fn list_sorted(&self) -> Vec<Arc<OutboundConnection>> {
        let mut connections: Vec<_> = self.snapshot().into_values().collect();
        connections.sort_by(|a, b| a.key().cmp(b.key()));
        connections
    }

    /// Connected connections, sorted by key.
    pub fn connected_sorted(&self) -> Vec<Arc<OutboundConnection>> {
        self.list_sorted()
            .into_iter()
            .filter(|c| c.is_connected())
            .collect()
    }

    /// Close every connection concurrently and clear the map.
    pub async fn shutdown(&self) {
        let connections: Vec<_> = {
            let mut map = self.connections.write().expect("connections lock poisoned");
            map.drain().map(|(_, c)| c).collect()
        };

        let mut join_set = JoinSet::new();
        for connection in connections {
            join_set.spawn(async move {
                connection.set_status(ConnectionStatus::Disconnected);
                if let Err(e) = connection.client.close().await {
                    warn!(server = %connection.key(), "error closing upstream: {e}");
                }
            });
        }
        while join_set.join_next().await.is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportConfig;

    fn server_config(
        enabled: Option<Vec<&str>>,
        disabled: Option<Vec<&str>>,
    ) -> ServerConfig {
        let mut config = ServerConfig::new(TransportConfig::Http {
            url: "http://localhost/mcp".into(),
            headers: HashMap::new(),
        });
        config.enabled_tools = enabled.map(|v| v.into_iter().map(String::from).collect());
        config.disabled_tools = disabled.map(|v| v.into_iter().map(String::from).collect());
        config
    }

    #[test]
    fn whitelist_wins_over_blacklist() {
        let filters = CapabilityFilters::from_config(&server_config(
            Some(vec!["tool-a"]),
            Some(vec!["tool-a", "tool-b"]),
        ));
        assert!(filters.allows_tool("tool-a"));
        assert!(!filters.allows_tool("tool-b"));
        assert!(!filters.allows_tool("tool-c"));
    }

    #[test]
    fn blacklist_applies_without_whitelist() {
        let filters =
            CapabilityFilters::from_config(&server_config(None, Some(vec!["blocked"])));
        assert!(!filters.allows_tool("blocked"));
        assert!(filters.allows_tool("open"));
    }

    #[test]
    fn no_lists_allow_everything() {
        let filters = CapabilityFilters::from_config(&server_config(None, None));
        assert!(filters.allows_tool("anything"));
        assert!(filters.allows_resource("file:///x"));
        assert!(filters.allows_prompt("p"));
    }

    #[test]
    fn base_name_strips_suffix() {
        let config = server_config(None, None);
        let client = Arc::new(McpClient::new(
            Box::new(onemcp_client::ChannelTransport::pair().0),
            onemcp_client::ClientConfig::default(),
        ));
        let connection = OutboundConnection::new("tmpl:abc123", config, client);
        assert_eq!(connection.base_name(), "tmpl");
        assert_eq!(connection.key(), "tmpl:abc123");
        assert_eq!(connection.status(), ConnectionStatus::Disconnected);
    }
}
