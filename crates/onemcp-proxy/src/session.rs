//! Inbound session registry.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::config::SessionConfig;
use crate::context::SessionContext;

/// One inbound MCP session.
///
/// The session id is fixed at creation and never mutated.
pub struct InboundSession {
    pub context: SessionContext,
    pub config: SessionConfig,
    pub created_at: DateTime<Utc>,
}

impl InboundSession {
    pub fn session_id(&self) -> &str {
        &self.context.session_id
    }
}

/// Registry of live inbound sessions.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<InboundSession>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, context: SessionContext, config: SessionConfig) -> Arc<InboundSession> {
        let session = Arc::new(InboundSession {
            context,
            config,
            created_at: Utc::now(),
        });
        self.sessions
            .write()
            .expect("sessions lock poisoned")
            .insert(session.session_id().to_string(), session.clone());
        session
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<InboundSession>> {
        self.sessions
            .read()
            .expect("sessions lock poisoned")
            .get(session_id)
            .cloned()
    }

    /// Session config, falling back to the given default for unknown ids.
    pub fn config_for(&self, session_id: &str, default: &SessionConfig) -> SessionConfig {
        self.get(session_id)
            .map(|s| s.config.clone())
            .unwrap_or_else(|| default.clone())
    }

    pub fn remove(&self, session_id: &str) -> Option<Arc<InboundSession>> {
        self.sessions
            .write()
            .expect("sessions lock poisoned")
            .remove(session_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.read().expect("sessions lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_get_remove() {
        let registry = SessionRegistry::new();
        let session = registry.create(SessionContext::new("s-1"), SessionConfig::default());
        assert_eq!(session.session_id(), "s-1");
        assert!(registry.get("s-1").is_some());
        assert_eq!(registry.len(), 1);

        registry.remove("s-1");
        assert!(registry.get("s-1").is_none());
        assert!(registry.is_empty());
    }
}
