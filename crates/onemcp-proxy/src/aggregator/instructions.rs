//! Instruction aggregation: the educational preamble handed to an inbound
//! session at initialize.
//!
//! Each upstream may carry free-form instructions (from its initialize
//! result, or overridden in configuration). They are stitched together
//! through the placeholder renderer; a session may bring its own template,
//! and a broken custom template falls back to the default instead of
//! aborting the session.

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;

use crate::config::SessionConfig;
use crate::connection::OutboundConnection;
use crate::routing::NAME_SEPARATOR;
use crate::template::renderer;

const DEFAULT_TEMPLATE: &str = "\
You are connected to a 1MCP gateway aggregating {{serverCount}} MCP server(s): {{serverList}}.

Capability names are prefixed with their server name and the separator \
`_1mcp_`. Always use the prefixed name when calling a tool, reading a \
resource, or getting a prompt.

{{serverInstructions}}";

/// Renders the per-session instructions preamble.
pub struct InstructionAggregator;

impl InstructionAggregator {
    pub fn new() -> Self {
        Self
    }

    /// Build the preamble for the given (already session-filtered)
    /// connections.
    pub fn aggregate(
        &self,
        connections: &[Arc<OutboundConnection>],
        session: &SessionConfig,
    ) -> String {
        let mut names: Vec<&str> = connections.iter().map(|c| c.base_name()).collect();
        names.sort_unstable();
        names.dedup();

        let mut sections = String::new();
        for connection in connections {
            if let Some(instructions) = connection.instructions() {
                let trimmed = instructions.trim();
                if trimmed.is_empty() {
                    continue;
                }
                sections.push_str(&format!(
                    "## {}\nTool prefix: `{}{}`\n{}\n\n",
                    connection.base_name(),
                    connection.base_name(),
                    NAME_SEPARATOR,
                    trimmed
                ));
            }
        }

        let mut variables = BTreeMap::new();
        variables.insert("serverCount".to_string(), names.len().to_string());
        variables.insert("serverList".to_string(), names.join(", "));
        variables.insert(
            "serverInstructions".to_string(),
            sections.trim_end().to_string(),
        );

        let template = session.custom_template.as_deref().unwrap_or(DEFAULT_TEMPLATE);
        let rendered = match renderer::render_str(template, &variables) {
            Ok(rendered) => rendered,
            Err(e) => {
                warn!("custom instructions template failed to render, using default: {e}");
                renderer::render_str(DEFAULT_TEMPLATE, &variables)
                    .unwrap_or_else(|_| variables["serverList"].clone())
            }
        };

        match session.template_size_limit {
            Some(limit) => truncate_at_char_boundary(rendered, limit),
            None => rendered,
        }
    }
}

impl Default for InstructionAggregator {
    fn default() -> Self {
        Self::new()
    }
}

fn truncate_at_char_boundary(mut text: String, limit: usize) -> String {
    if text.len() <= limit {
        return text;
    }
    let mut cut = limit;
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ServerConfig, TransportConfig};
    use onemcp_client::{ChannelTransport, ClientConfig, McpClient};

    fn connection(name: &str, instructions: Option<&str>) -> Arc<OutboundConnection> {
        let (transport, _peer) = ChannelTransport::pair();
        let client = Arc::new(McpClient::new(Box::new(transport), ClientConfig::default()));
        let mut config = ServerConfig::new(TransportConfig::Http {
            url: "http://x/mcp".into(),
            headers: Default::default(),
        });
        config.instructions = instructions.map(String::from);
        Arc::new(OutboundConnection::new(name, config, client))
    }

    #[test]
    fn default_template_lists_servers_and_sections() {
        let connections = vec![
            connection("fs", Some("Read-only filesystem access.")),
            connection("db", None),
        ];
        let preamble =
            InstructionAggregator::new().aggregate(&connections, &SessionConfig::default());
        assert!(preamble.contains("2 MCP server(s): db, fs"));
        assert!(preamble.contains("## fs"));
        assert!(preamble.contains("Read-only filesystem access."));
        assert!(!preamble.contains("## db"));
    }

    #[test]
    fn custom_template_is_used_when_it_renders() {
        let session = SessionConfig {
            custom_template: Some("Servers: {{serverList}}".to_string()),
            ..Default::default()
        };
        let preamble =
            InstructionAggregator::new().aggregate(&[connection("fs", None)], &session);
        assert_eq!(preamble, "Servers: fs");
    }

    #[test]
    fn broken_custom_template_falls_back_to_default() {
        let session = SessionConfig {
            custom_template: Some("{{noSuchVariable}}".to_string()),
            ..Default::default()
        };
        let preamble =
            InstructionAggregator::new().aggregate(&[connection("fs", None)], &session);
        assert!(preamble.contains("1 MCP server(s): fs"));
    }

    #[test]
    fn size_limit_truncates_on_char_boundary() {
        let session = SessionConfig {
            template_size_limit: Some(10),
            ..Default::default()
        };
        let preamble =
            InstructionAggregator::new().aggregate(&[connection("fs", None)], &session);
        assert!(preamble.len() <= 10);
    }
}
