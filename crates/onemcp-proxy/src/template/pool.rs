//! Client instance pool for template servers.
//!
//! Instances are keyed `{template}:{renderedHash}` (shareable) or
//! `{template}:{sessionId}` (per-client) and registered in the outbound
//! connections map under the same key, which is what makes them routable.
//! Reference counts track attached client ids; idle instances are reclaimed
//! by a sweep task owned by the pool.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use onemcp_client::{ClientError, McpClient};

use crate::config::{PoolConfig, ServerConfig};
use crate::connection::{ConnectionManager, OutboundConnection};
use crate::context::SessionContext;
use crate::template::renderer::{self, TemplateError};

/// Pool operation failures.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("instance limit reached for template '{template}' (max {limit})")]
    LimitExceeded { template: String, limit: usize },

    #[error("total instance limit reached (max {limit})")]
    TotalLimitExceeded { limit: usize },

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error("failed to connect template instance: {0}")]
    Connect(#[source] ClientError),

    #[error("invalid rendered configuration: {0}")]
    InvalidConfig(String),
}

/// Lifecycle state of a pooled instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceStatus {
    Active,
    Idle,
    Terminating,
}

struct InstanceState {
    client_ids: HashSet<String>,
    status: InstanceStatus,
    last_used_at: Instant,
}

/// One materialised template instance.
pub struct PooledInstance {
    pub id: String,
    pub template_name: String,
    pub key: String,
    pub client: Arc<McpClient>,
    pub rendered_hash: String,
    pub template_variables: BTreeMap<String, String>,
    pub processed_config: ServerConfig,
    pub created_at: Instant,
    pub idle_timeout: Duration,
    state: StdMutex<InstanceState>,
}

impl PooledInstance {
    fn new(
        template_name: String,
        key: String,
        client: Arc<McpClient>,
        rendered_hash: String,
        template_variables: BTreeMap<String, String>,
        processed_config: ServerConfig,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            template_name,
            key,
            client,
            rendered_hash,
            template_variables,
            processed_config,
            created_at: Instant::now(),
            idle_timeout,
            state: StdMutex::new(InstanceState {
                client_ids: HashSet::new(),
                status: InstanceStatus::Idle,
                last_used_at: Instant::now(),
            }),
        }
    }

    pub fn status(&self) -> InstanceStatus {
        self.state.lock().expect("instance state poisoned").status
    }

    pub fn reference_count(&self) -> usize {
        self.state
            .lock()
            .expect("instance state poisoned")
            .client_ids
            .len()
    }

    pub fn client_ids(&self) -> HashSet<String> {
        self.state
            .lock()
            .expect("instance state poisoned")
            .client_ids
            .clone()
    }

    pub fn last_used_at(&self) -> Instant {
        self.state
            .lock()
            .expect("instance state poisoned")
            .last_used_at
    }

    pub fn is_terminating(&self) -> bool {
        self.status() == InstanceStatus::Terminating
    }

    /// Attach a client id. Idempotent; refuses terminating instances.
    fn add_client(&self, client_id: &str) -> bool {
        let mut state = self.state.lock().expect("instance state poisoned");
        if state.status == InstanceStatus::Terminating {
            return false;
        }
        state.client_ids.insert(client_id.to_string());
        state.status = InstanceStatus::Active;
        state.last_used_at = Instant::now();
        true
    }

    /// Detach a client id, returning the remaining reference count.
    fn remove_client(&self, client_id: &str) -> usize {
        let mut state = self.state.lock().expect("instance state poisoned");
        state.client_ids.remove(client_id);
        if state.client_ids.is_empty() && state.status == InstanceStatus::Active {
            state.status = InstanceStatus::Idle;
            state.last_used_at = Instant::now();
        }
        state.client_ids.len()
    }

    /// Move to terminating; no new clients may attach afterwards.
    fn begin_termination(&self) -> bool {
        let mut state = self.state.lock().expect("instance state poisoned");
        if state.status == InstanceStatus::Terminating {
            return false;
        }
        state.status = InstanceStatus::Terminating;
        true
    }

    fn idle_expired(&self, now: Instant) -> bool {
        let state = self.state.lock().expect("instance state poisoned");
        state.status == InstanceStatus::Idle
            && now.duration_since(state.last_used_at) > self.idle_timeout
    }
}

/// `sessionId -> templateName -> renderedHash`; the only way a session
/// discovers which shareable instance key it may see.
pub type SessionTemplateHashes = HashMap<String, HashMap<String, String>>;

/// Pool of running template instances.
pub struct ClientInstancePool {
    config: PoolConfig,
    connections: Arc<ConnectionManager>,
    instances: tokio::sync::Mutex<HashMap<String, Arc<PooledInstance>>>,
    session_hashes: Arc<RwLock<SessionTemplateHashes>>,
    cleanup_task: StdMutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ClientInstancePool {
    pub fn new(config: PoolConfig, connections: Arc<ConnectionManager>) -> Self {
        Self {
            config,
            connections,
            instances: tokio::sync::Mutex::new(HashMap::new()),
            session_hashes: Arc::new(RwLock::new(SessionTemplateHashes::new())),
            cleanup_task: StdMutex::new(None),
        }
    }

    /// Shared view of the session hash registry, consumed by routing.
    pub fn session_hashes(&self) -> Arc<RwLock<SessionTemplateHashes>> {
        self.session_hashes.clone()
    }

    /// Materialise (or reuse) an instance of `template_name` for the given
    /// context, attaching `client_id` to it.
    pub async fn get_or_create_client_instance(
        &self,
        template_name: &str,
        template_config: &ServerConfig,
        context: &SessionContext,
        client_id: &str,
    ) -> Result<Arc<PooledInstance>, PoolError> {
        let options = template_config.template_options();

        let template_json = serde_json::to_value(template_config).map_err(TemplateError::from)?;
        let variables = renderer::resolve_variables(&template_json, context)?;
        let rendered_json = renderer::render_value(&template_json, &variables)?;
        let processed_config: ServerConfig = serde_json::from_value(rendered_json)
            .map_err(|e| PoolError::InvalidConfig(e.to_string()))?;
        let hash = renderer::rendered_hash(&variables);

        // Non-shareable templates are keyed per session like per-client ones;
        // only shareable instances may be reached through the hash key.
        let key = if options.per_client || !options.shareable {
            format!("{template_name}:{}", context.session_id)
        } else {
            format!("{template_name}:{hash}")
        };

        let mut instances = self.instances.lock().await;

        if let Some(existing) = instances.get(&key) {
            if !existing.is_terminating() && existing.add_client(client_id) {
                debug!(key, client_id, refs = existing.reference_count(), "reusing template instance");
                self.record_session_hash(&context.session_id, template_name, &hash);
                return Ok(existing.clone());
            }
        }

        let per_template_limit = options.max_instances.unwrap_or(self.config.max_instances);
        let per_template_count = instances
            .values()
            .filter(|i| i.template_name == template_name && !i.is_terminating())
            .count();
        if per_template_count >= per_template_limit {
            return Err(PoolError::LimitExceeded {
                template: template_name.to_string(),
                limit: per_template_limit,
            });
        }
        let total_count = instances.values().filter(|i| !i.is_terminating()).count();
        if total_count >= self.config.max_total_instances {
            return Err(PoolError::TotalLimitExceeded {
                limit: self.config.max_total_instances,
            });
        }

        let client = self
            .connections
            .connector()
            .build(template_name, &processed_config)
            .await
            .map_err(PoolError::Connect)?;
        client.connect().await.map_err(PoolError::Connect)?;

        let idle_timeout = options
            .idle_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.config.idle_timeout());

        let instance = Arc::new(PooledInstance::new(
            template_name.to_string(),
            key.clone(),
            client.clone(),
            hash.clone(),
            variables,
            processed_config.clone(),
            idle_timeout,
        ));
        instance.add_client(client_id);
        instances.insert(key.clone(), instance.clone());
        drop(instances);

        let connection = Arc::new(OutboundConnection::new(
            key.clone(),
            processed_config,
            client,
        ));
        connection.mark_connected();
        self.connections.insert(connection);

        self.record_session_hash(&context.session_id, template_name, &hash);
        info!(key, template = template_name, "created template instance");
        Ok(instance)
    }

    fn record_session_hash(&self, session_id: &str, template_name: &str, hash: &str) {
        self.session_hashes
            .write()
            .expect("session hashes lock poisoned")
            .entry(session_id.to_string())
            .or_default()
            .insert(template_name.to_string(), hash.to_string());
    }

    /// Detach a client id from the instance under `key`.
    pub async fn remove_client_from_instance(&self, key: &str, client_id: &str) {
        let instances = self.instances.lock().await;
        if let Some(instance) = instances.get(key) {
            let remaining = instance.remove_client(client_id);
            debug!(key, client_id, remaining, "detached client from instance");
        }
    }

    /// Detach a session from every instance and forget its hash registry.
    pub async fn detach_session(&self, session_id: &str) {
        let instances = self.instances.lock().await;
        for instance in instances.values() {
            instance.remove_client(session_id);
        }
        drop(instances);
        self.session_hashes
            .write()
            .expect("session hashes lock poisoned")
            .remove(session_id);
    }

    pub async fn instance(&self, key: &str) -> Option<Arc<PooledInstance>> {
        self.instances.lock().await.get(key).cloned()
    }

    pub async fn instance_count(&self) -> usize {
        self.instances.lock().await.len()
    }

    /// Reclaim idle-expired instances. The instance lock is not held across
    /// any close I/O.
    pub async fn run_cleanup_once(&self) {
        let now = Instant::now();
        let victims: Vec<Arc<PooledInstance>> = {
            let mut instances = self.instances.lock().await;
            let keys: Vec<String> = instances
                .iter()
                .filter(|(_, i)| i.idle_expired(now))
                .map(|(k, _)| k.clone())
                .collect();
            keys.iter()
                .filter_map(|key| {
                    let instance = instances.remove(key)?;
                    instance.begin_termination();
                    Some(instance)
                })
                .collect()
        };

        if victims.is_empty() {
            return;
        }

        let mut join_set = JoinSet::new();
        for instance in victims {
            let connections = self.connections.clone();
            join_set.spawn(async move {
                info!(key = %instance.key, "reclaiming idle template instance");
                connections.remove(&instance.key);
                if let Err(e) = instance.client.close().await {
                    warn!(key = %instance.key, "error closing idle instance: {e}");
                }
            });
        }
        while join_set.join_next().await.is_some() {}
    }

    /// Start the periodic idle sweep. Idempotent.
    pub fn start_cleanup_task(self: &Arc<Self>) {
        let mut slot = self.cleanup_task.lock().expect("cleanup task lock poisoned");
        if slot.is_some() {
            return;
        }
        let pool = Arc::downgrade(self);
        let interval = self.config.cleanup_interval();
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(pool) = pool.upgrade() else { break };
                pool.run_cleanup_once().await;
            }
        }));
    }

    /// Stop the sweep task and close every instance concurrently.
    pub async fn shutdown(&self) {
        if let Some(task) = self
            .cleanup_task
            .lock()
            .expect("cleanup task lock poisoned")
            .take()
        {
            task.abort();
        }

        let instances: Vec<Arc<PooledInstance>> = {
            let mut map = self.instances.lock().await;
            map.drain()
                .map(|(_, instance)| {
                    instance.begin_termination();
                    instance
                })
                .collect()
        };

        let mut join_set = JoinSet::new();
        for instance in instances {
            let connections = self.connections.clone();
            join_set.spawn(async move {
                connections.remove(&instance.key);
                if let Err(e) = instance.client.close().await {
                    warn!(key = %instance.key, "error closing instance at shutdown: {e}");
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
    use onemcp_client::{ChannelTransport, ClientConfig};

    fn test_instance() -> PooledInstance {
        let (transport, _peer) = ChannelTransport::pair();
        let client = Arc::new(McpClient::new(Box::new(transport), ClientConfig::default()));
        PooledInstance::new(
            "tmpl".to_string(),
            "tmpl:abc".to_string(),
            client,
            "abc".to_string(),
            BTreeMap::new(),
            ServerConfig::new(TransportConfig::Http {
                url: "http://x/mcp".into(),
                headers: HashMap::new(),
            }),
            Duration::from_millis(100),
        )
    }

    #[test]
    fn add_client_is_idempotent() {
        let instance = test_instance();
        assert!(instance.add_client("s1"));
        assert!(instance.add_client("s1"));
        assert_eq!(instance.reference_count(), 1);
        assert_eq!(instance.status(), InstanceStatus::Active);
    }

    #[test]
    fn refcount_tracks_client_ids_and_idle_transition() {
        let instance = test_instance();
        instance.add_client("s1");
        instance.add_client("s2");
        assert_eq!(instance.reference_count(), instance.client_ids().len());
        assert_eq!(instance.reference_count(), 2);

        assert_eq!(instance.remove_client("s1"), 1);
        assert_eq!(instance.status(), InstanceStatus::Active);
        assert_eq!(instance.remove_client("s2"), 0);
        assert_eq!(instance.status(), InstanceStatus::Idle);
    }

    #[test]
    fn terminating_refuses_new_clients() {
        let instance = test_instance();
        instance.add_client("s1");
        assert!(instance.begin_termination());
        assert!(!instance.begin_termination());
        assert!(!instance.add_client("s2"));
    }

    #[test]
    fn idle_expiry_requires_idle_status() {
        let instance = test_instance();
        instance.add_client("s1");
        // Active instances never expire regardless of age.
        let later = Instant::now() + Duration::from_secs(3600);
        assert!(!instance.idle_expired(later));

        instance.remove_client("s1");
        assert!(instance.idle_expired(later));
        assert!(!instance.idle_expired(Instant::now()));
    }
}
