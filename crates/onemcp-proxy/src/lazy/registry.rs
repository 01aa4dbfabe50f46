//! Tool registry: the catalogue-level index of known upstream tools.
//!
//! Holds `(server, tool) -> metadata` plus per-server tags. No schemas live
//! here; those belong to the schema cache. Listing is stable-sorted by
//! `(server, name)` with an opaque offset cursor, so iteration is
//! restartable across calls.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use thiserror::Error;

/// Default page size for registry listings.
pub const DEFAULT_LIST_LIMIT: usize = 100;

/// Registry lookup failures, surfaced as validation errors by the meta-tools.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },

    #[error("invalid cursor")]
    InvalidCursor,
}

/// Catalogue-level description of one tool.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolMetadata {
    pub server: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
}

impl ToolMetadata {
    pub fn new(server: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            name: name.into(),
            description: None,
            tags: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Filters for a registry listing.
#[derive(Debug, Clone, Default)]
pub struct ListToolsQuery {
    pub server: Option<String>,
    pub pattern: Option<String>,
    pub tag: Option<String>,
    pub limit: Option<usize>,
    pub cursor: Option<String>,
}

/// One page of a registry listing.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolListPage {
    pub tools: Vec<ToolMetadata>,
    pub total_count: usize,
    pub servers: Vec<String>,
    pub has_more: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

/// In-memory tool index.
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<(String, String), ToolMetadata>,
    server_tags: HashMap<String, Vec<String>>,
}

impl ToolRegistry {
    pub fn from_tools_map(
        server_tools: HashMap<String, Vec<ToolMetadata>>,
        server_tags: HashMap<String, Vec<String>>,
    ) -> Self {
        let mut tools = BTreeMap::new();
        for (server, list) in server_tools {
            for mut metadata in list {
                metadata.server = server.clone();
                tools.insert((server.clone(), metadata.name.clone()), metadata);
            }
        }
        Self { tools, server_tags }
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn has_tool(&self, server: &str, tool: &str) -> bool {
        self.tools
            .contains_key(&(server.to_string(), tool.to_string()))
    }

    pub fn get(&self, server: &str, tool: &str) -> Option<&ToolMetadata> {
        self.tools.get(&(server.to_string(), tool.to_string()))
    }

    /// Distinct server names, sorted.
    pub fn get_servers(&self) -> Vec<String> {
        let mut servers: Vec<String> = self
            .tools
            .keys()
            .map(|(server, _)| server.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        servers.sort();
        servers
    }

    pub fn server_tags(&self, server: &str) -> &[String] {
        self.server_tags
            .get(server)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Restartable iteration in `(server, name)` order.
    pub fn iter(&self) -> impl Iterator<Item = &ToolMetadata> {
        self.tools.values()
    }

    /// A view restricted to the given servers.
    pub fn filter_by_servers(&self, allowed: &HashSet<String>) -> ToolRegistry {
        ToolRegistry {
            tools: self
                .tools
                .iter()
                .filter(|((server, _), _)| allowed.contains(server))
                .map(|(key, metadata)| (key.clone(), metadata.clone()))
                .collect(),
            server_tags: self
                .server_tags
                .iter()
                .filter(|(server, _)| allowed.contains(*server))
                .map(|(server, tags)| (server.clone(), tags.clone()))
                .collect(),
        }
    }

    /// List tools matching the query, paginated.
    pub fn list_tools(&self, query: &ListToolsQuery) -> Result<ToolListPage, RegistryError> {
        let pattern = query
            .pattern
            .as_deref()
            .map(compile_glob)
            .transpose()
            .map_err(|message| RegistryError::InvalidPattern {
                pattern: query.pattern.clone().unwrap_or_default(),
                message,
            })?;
        let tag = query.tag.as_deref().map(str::to_lowercase);

        let matches: Vec<&ToolMetadata> = self
            .tools
            .values()
            .filter(|metadata| {
                if let Some(server) = &query.server {
                    if &metadata.server != server {
                        return false;
                    }
                }
                if let Some(pattern) = &pattern {
                    if !pattern.is_match(&metadata.name) {
                        return false;
                    }
                }
                if let Some(tag) = &tag {
                    let tool_tagged = metadata
                        .tags
                        .as_ref()
                        .is_some_and(|tags| tags.iter().any(|t| t.to_lowercase() == *tag));
                    let server_tagged = self
                        .server_tags(&metadata.server)
                        .iter()
                        .any(|t| t.to_lowercase() == *tag);
                    if !tool_tagged && !server_tagged {
                        return false;
                    }
                }
                true
            })
            .collect();

        let total_count = matches.len();
        let mut servers: Vec<String> = matches
            .iter()
            .map(|m| m.server.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        servers.sort();

        let offset = match &query.cursor {
            Some(cursor) => decode_cursor(cursor)?,
            None => 0,
        };
        let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT).max(1);

        let page: Vec<ToolMetadata> = matches
            .into_iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect();
        let has_more = offset + page.len() < total_count;

        Ok(ToolListPage {
            tools: page,
            total_count,
            servers,
            has_more,
            next_cursor: has_more.then(|| encode_cursor(offset + limit)),
        })
    }
}

/// Compile a `*`/`?` glob to an anchored regex; every other character is
/// escape-safe.
pub(crate) fn compile_glob(pattern: &str) -> Result<Regex, String> {
    let mut regex = String::with_capacity(pattern.len() + 8);
    regex.push('^');
    for c in pattern.chars() {
        match c {
            '*' => regex.push_str(".*"),
            '?' => regex.push('.'),
            c => regex.push_str(&regex::escape(&c.to_string())),
        }
    }
    regex.push('$');
    Regex::new(&regex).map_err(|e| e.to_string())
}

fn encode_cursor(offset: usize) -> String {
    BASE64.encode(format!("o:{offset}"))
}

fn decode_cursor(cursor: &str) -> Result<usize, RegistryError> {
    let raw = BASE64.decode(cursor).map_err(|_| RegistryError::InvalidCursor)?;
    let raw = String::from_utf8(raw).map_err(|_| RegistryError::InvalidCursor)?;
    raw.strip_prefix("o:")
        .and_then(|offset| offset.parse().ok())
        .ok_or(RegistryError::InvalidCursor)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ToolRegistry {
        let tools = HashMap::from([
            (
                "db".to_string(),
                vec![
                    ToolMetadata::new("db", "query").with_description("Run a query"),
                    ToolMetadata::new("db", "migrate"),
                ],
            ),
            (
                "fs".to_string(),
                vec![
                    ToolMetadata::new("fs", "read_file"),
                    ToolMetadata::new("fs", "write_file"),
                ],
            ),
        ]);
        let tags = HashMap::from([
            ("db".to_string(), vec!["storage".to_string()]),
            ("fs".to_string(), vec!["files".to_string()]),
        ]);
        ToolRegistry::from_tools_map(tools, tags)
    }

    #[test]
    fn listing_is_sorted_by_server_then_name() {
        let page = registry().list_tools(&ListToolsQuery::default()).unwrap();
        let names: Vec<(String, String)> = page
            .tools
            .iter()
            .map(|t| (t.server.clone(), t.name.clone()))
            .collect();
        assert_eq!(
            names,
            vec![
                ("db".to_string(), "migrate".to_string()),
                ("db".to_string(), "query".to_string()),
                ("fs".to_string(), "read_file".to_string()),
                ("fs".to_string(), "write_file".to_string()),
            ]
        );
        assert_eq!(page.total_count, 4);
        assert_eq!(page.servers, vec!["db".to_string(), "fs".to_string()]);
        assert!(!page.has_more);
    }

    #[test]
    fn glob_pattern_filters_names() {
        let page = registry()
            .list_tools(&ListToolsQuery {
                pattern: Some("*_file".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(page.tools.len(), 2);
        assert!(page.tools.iter().all(|t| t.server == "fs"));

        let page = registry()
            .list_tools(&ListToolsQuery {
                pattern: Some("quer?".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(page.tools.len(), 1);
        assert_eq!(page.tools[0].name, "query");
    }

    #[test]
    fn glob_escapes_regex_metacharacters() {
        // A dot in the pattern must match a literal dot only.
        let regex = compile_glob("a.b*").unwrap();
        assert!(regex.is_match("a.bc"));
        assert!(!regex.is_match("axbc"));
    }

    #[test]
    fn tag_filter_uses_server_tags_case_insensitively() {
        let page = registry()
            .list_tools(&ListToolsQuery {
                tag: Some("STORAGE".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(page.tools.len(), 2);
        assert!(page.tools.iter().all(|t| t.server == "db"));
    }

    #[test]
    fn pagination_cursor_roundtrip() {
        let registry = registry();
        let first = registry
            .list_tools(&ListToolsQuery {
                limit: Some(3),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(first.tools.len(), 3);
        assert!(first.has_more);

        let second = registry
            .list_tools(&ListToolsQuery {
                limit: Some(3),
                cursor: first.next_cursor.clone(),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(second.tools.len(), 1);
        assert!(!second.has_more);
        assert!(second.next_cursor.is_none());
        assert_eq!(second.tools[0].name, "write_file");
    }

    #[test]
    fn invalid_cursor_is_rejected() {
        let result = registry().list_tools(&ListToolsQuery {
            cursor: Some("!!not-base64!!".to_string()),
            ..Default::default()
        });
        assert!(matches!(result, Err(RegistryError::InvalidCursor)));
    }

    #[test]
    fn filter_by_servers_restricts_view() {
        let allowed: HashSet<String> = ["fs".to_string()].into();
        let view = registry().filter_by_servers(&allowed);
        assert_eq!(view.len(), 2);
        assert!(view.has_tool("fs", "read_file"));
        assert!(!view.has_tool("db", "query"));
        assert_eq!(view.get_servers(), vec!["fs".to_string()]);
    }
}
