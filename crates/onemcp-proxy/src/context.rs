//! Session context: the variable bindings a template server renders against.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Context carried by an inbound session.
///
/// `session_id` is fixed at session creation and never mutated afterwards;
/// the three sub-maps hold arbitrary caller-supplied data addressed by dotted
/// paths (`project.root`, `user.email`, ...).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionContext {
    pub session_id: String,
    #[serde(default)]
    pub project: Map<String, Value>,
    #[serde(default)]
    pub user: Map<String, Value>,
    #[serde(default)]
    pub environment: Map<String, Value>,
}

impl SessionContext {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            ..Default::default()
        }
    }

    pub fn with_project(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.project.insert(key.into(), value.into());
        self
    }

    pub fn with_user(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.user.insert(key.into(), value.into());
        self
    }

    pub fn with_environment(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    /// Resolve a dotted path to its string rendering.
    ///
    /// `sessionId` resolves to the session id; `project.*`, `user.*` and
    /// `environment.*` walk the respective map. Non-string leaves render as
    /// compact JSON.
    pub fn lookup(&self, path: &str) -> Option<String> {
        if path == "sessionId" {
            return Some(self.session_id.clone());
        }

        let (root, rest) = path.split_once('.')?;
        let map = match root {
            "project" => &self.project,
            "user" => &self.user,
            "environment" => &self.environment,
            _ => return None,
        };

        let mut current: &Value = map.get(rest.split('.').next()?)?;
        for segment in rest.split('.').skip(1) {
            current = current.get(segment)?;
        }

        Some(match current {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }
}
