//! Gateway configuration.
//!
//! Everything the core consumes from the configuration file lives here, as
//! plain serde types with per-field defaults. Loading is a straight JSON
//! parse; watching and rewriting the file belong to outer tooling.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ProxyError, ProxyResult};

/// Top-level gateway configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfig {
    /// Upstream servers, keyed by name. Names become routing prefixes.
    #[serde(default)]
    pub servers: HashMap<String, ServerConfig>,

    /// Named tag sets referencable from a session's `presetName`.
    #[serde(default)]
    pub presets: HashMap<String, Vec<String>>,

    #[serde(default)]
    pub lazy_loading: LazyLoadingConfig,

    #[serde(default)]
    pub pool: PoolConfig,

    /// Defaults applied to inbound sessions that bring no config of their own.
    #[serde(default)]
    pub session: SessionConfig,
}

impl ProxyConfig {
    /// Load and validate a configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> ProxyResult<Self> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            ProxyError::config(format!("cannot read {}: {e}", path.as_ref().display()))
        })?;
        let config: ProxyConfig = serde_json::from_str(&raw)
            .map_err(|e| ProxyError::config(format!("invalid configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ProxyResult<()> {
        if self.lazy_loading.cache.max_entries == 0 {
            return Err(ProxyError::config("lazyLoading.cache.maxEntries must be > 0"));
        }
        for (name, server) in &self.servers {
            if name.is_empty() || name.contains(':') {
                return Err(ProxyError::config(format!(
                    "invalid server name '{name}': must be non-empty and contain no ':'"
                )));
            }
            if let Some(template) = &server.template {
                if template.max_instances == Some(0) {
                    return Err(ProxyError::config(format!(
                        "server '{name}': template.maxInstances must be > 0"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// One upstream server definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    pub transport: TransportConfig,

    /// Tags used by session filtering.
    #[serde(default)]
    pub tags: Vec<String>,

    /// Whitelist / blacklist pairs. A whitelist, when present, wins outright.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled_tools: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled_tools: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled_resources: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled_resources: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled_prompts: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled_prompts: Option<Vec<String>>,

    /// Overrides the instructions string the server reports at initialize.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,

    /// Present when this definition is a template to be materialised per
    /// rendered context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<TemplateOptions>,

    /// Per-request deadline for calls to this server.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl ServerConfig {
    pub fn new(transport: TransportConfig) -> Self {
        Self {
            transport,
            tags: Vec::new(),
            enabled_tools: None,
            disabled_tools: None,
            enabled_resources: None,
            disabled_resources: None,
            enabled_prompts: None,
            disabled_prompts: None,
            instructions: None,
            template: None,
            request_timeout_ms: default_request_timeout_ms(),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Whether this definition must go through the template instance pool.
    pub fn is_template(&self) -> bool {
        self.template.is_some()
    }

    pub fn template_options(&self) -> TemplateOptions {
        self.template.clone().unwrap_or_default()
    }
}

fn default_request_timeout_ms() -> u64 {
    60_000
}

/// Transport selection for an upstream server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportConfig {
    #[serde(rename_all = "camelCase")]
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<PathBuf>,
    },
    #[serde(rename_all = "camelCase")]
    Http {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
}

/// Template behaviour knobs on a server definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateOptions {
    #[serde(default = "default_true")]
    pub shareable: bool,
    #[serde(default)]
    pub per_client: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_instances: Option<usize>,
}

impl Default for TemplateOptions {
    fn default() -> Self {
        Self {
            shareable: true,
            per_client: false,
            idle_timeout_ms: None,
            max_instances: None,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Instance pool limits and sweep cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolConfig {
    /// Per-template ceiling on live instances
    #[serde(default = "default_max_instances")]
    pub max_instances: usize,
    /// Global ceiling on live instances
    #[serde(default = "default_max_total_instances")]
    pub max_total_instances: usize,
    /// Idle age after which an instance is reclaimed
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// Sweep cadence
    #[serde(default = "default_cleanup_interval_ms")]
    pub cleanup_interval_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_instances: default_max_instances(),
            max_total_instances: default_max_total_instances(),
            idle_timeout_ms: default_idle_timeout_ms(),
            cleanup_interval_ms: default_cleanup_interval_ms(),
        }
    }
}

impl PoolConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }
}

fn default_max_instances() -> usize {
    10
}

fn default_max_total_instances() -> usize {
    50
}

fn default_idle_timeout_ms() -> u64 {
    300_000
}

fn default_cleanup_interval_ms() -> u64 {
    60_000
}

/// Lazy loading (meta-tool) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LazyLoadingConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Upstream tool names exposed directly alongside the meta-tools.
    #[serde(default)]
    pub direct_expose: Vec<String>,

    #[serde(default)]
    pub cache: SchemaCacheConfig,

    #[serde(default)]
    pub preload: PreloadConfig,

    #[serde(default)]
    pub fallback: FallbackConfig,
}

impl Default for LazyLoadingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            direct_expose: Vec::new(),
            cache: SchemaCacheConfig::default(),
            preload: PreloadConfig::default(),
            fallback: FallbackConfig::default(),
        }
    }
}

/// Bounds for the schema cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaCacheConfig {
    #[serde(default = "default_cache_max_entries")]
    pub max_entries: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_ms: Option<u64>,
}

impl Default for SchemaCacheConfig {
    fn default() -> Self {
        Self {
            max_entries: default_cache_max_entries(),
            ttl_ms: None,
        }
    }
}

impl SchemaCacheConfig {
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl_ms.map(Duration::from_millis)
    }
}

fn default_cache_max_entries() -> usize {
    256
}

/// Eager schema loading at startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PreloadConfig {
    /// Glob patterns matched against server names
    #[serde(default)]
    pub patterns: Vec<String>,
    /// Substrings matched against tool names
    #[serde(default)]
    pub keywords: Vec<String>,
}

/// Behaviour when a lazy schema load fails.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FallbackConfig {
    #[serde(default)]
    pub on_error: FallbackMode,
    #[serde(default = "default_fallback_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            on_error: FallbackMode::Skip,
            timeout_ms: default_fallback_timeout_ms(),
        }
    }
}

fn default_fallback_timeout_ms() -> u64 {
    5_000
}

/// What to do with a tool whose schema cannot be loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FallbackMode {
    #[default]
    Skip,
}

/// How a session restricts which upstream servers it sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TagFilterMode {
    #[serde(rename = "none")]
    #[default]
    None,
    #[serde(rename = "simple-or")]
    SimpleOr,
    #[serde(rename = "advanced")]
    Advanced,
    #[serde(rename = "preset")]
    Preset,
}

/// Per-session configuration, supplied at handshake time or defaulted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    #[serde(default)]
    pub tag_filter_mode: TagFilterMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag_expression: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preset_name: Option<String>,
    #[serde(default)]
    pub enable_pagination: bool,
    /// Custom instructions template rendered into the inbound preamble
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_template: Option<String>,
    /// Hard cap on the rendered preamble, in bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_size_limit: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_parses() {
        let raw = r#"{
            "servers": {
                "fs": {
                    "transport": {"type": "stdio", "command": "mcp-fs", "args": ["--root", "/tmp"]},
                    "tags": ["files"]
                },
                "api": {
                    "transport": {"type": "http", "url": "http://localhost:8900/mcp"}
                }
            },
            "lazyLoading": {"enabled": true, "cache": {"maxEntries": 64, "ttlMs": 60000}}
        }"#;
        let config: ProxyConfig = serde_json::from_str(raw).unwrap();
        config.validate().unwrap();
        assert_eq!(config.servers.len(), 2);
        assert!(config.lazy_loading.enabled);
        assert_eq!(config.lazy_loading.cache.max_entries, 64);
        assert!(matches!(
            config.servers["fs"].transport,
            TransportConfig::Stdio { .. }
        ));
    }

    #[test]
    fn server_name_with_colon_rejected() {
        let mut config = ProxyConfig::default();
        config.servers.insert(
            "bad:name".to_string(),
            ServerConfig::new(TransportConfig::Http {
                url: "http://x".into(),
                headers: HashMap::new(),
            }),
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn template_defaults_are_shareable() {
        let options = TemplateOptions::default();
        assert!(options.shareable);
        assert!(!options.per_client);
    }

    #[test]
    fn from_file_validates() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(
            &mut file,
            br#"{"lazyLoading": {"cache": {"maxEntries": 0}}}"#,
        )
        .unwrap();
        assert!(ProxyConfig::from_file(file.path()).is_err());

        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, b"{}").unwrap();
        let config = ProxyConfig::from_file(file.path()).unwrap();
        assert!(config.servers.is_empty());
        assert!(!config.lazy_loading.enabled);
    }

    #[test]
    fn tag_filter_mode_wire_names() {
        assert_eq!(
            serde_json::to_string(&TagFilterMode::SimpleOr).unwrap(),
            "\"simple-or\""
        );
        let mode: TagFilterMode = serde_json::from_str("\"advanced\"").unwrap();
        assert_eq!(mode, TagFilterMode::Advanced);
    }
}
