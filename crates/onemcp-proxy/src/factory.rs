//! Default upstream connector: builds real transports from configuration.

use async_trait::async_trait;
use std::sync::Arc;
use url::Url;

use onemcp_client::{
    BoxedTransport, ClientConfig, ClientResult, HttpConfig, HttpTransport, McpClient, StdioConfig,
    StdioTransport, TransportError,
};
use onemcp_protocol::Implementation;

use crate::config::{ServerConfig, TransportConfig};
use crate::connection::UpstreamConnector;

/// Build a transport for a server definition.
pub fn build_transport(config: &ServerConfig) -> ClientResult<BoxedTransport> {
    match &config.transport {
        TransportConfig::Stdio {
            command,
            args,
            env,
            cwd,
        } => {
            let mut stdio = StdioConfig::new(command);
            stdio.args = args.clone();
            stdio.env = env.clone();
            stdio.cwd = cwd.clone();
            stdio.request_timeout = config.request_timeout();
            Ok(Box::new(StdioTransport::new(stdio)))
        }
        TransportConfig::Http { url, headers } => {
            let url = Url::parse(url)
                .map_err(|e| TransportError::ConnectionFailed(format!("invalid url '{url}': {e}")))?;
            let mut http = HttpConfig::new(url);
            http.headers = headers.clone();
            http.request_timeout = config.request_timeout();
            Ok(Box::new(HttpTransport::new(http)))
        }
    }
}

/// Connector that builds clients over real transports.
pub struct TransportConnector {
    client_info: Implementation,
}

impl TransportConnector {
    pub fn new() -> Self {
        Self {
            client_info: Implementation::new("onemcp-proxy", env!("CARGO_PKG_VERSION"))
                .with_title("1MCP Gateway"),
        }
    }
}

impl Default for TransportConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UpstreamConnector for TransportConnector {
    async fn build(&self, _name: &str, config: &ServerConfig) -> ClientResult<Arc<McpClient>> {
        let transport = build_transport(config)?;
        let client_config = ClientConfig {
            client_info: self.client_info.clone(),
            ..Default::default()
        };
        Ok(Arc::new(McpClient::new(transport, client_config)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn invalid_http_url_is_rejected() {
        let config = ServerConfig::new(TransportConfig::Http {
            url: "not a url".into(),
            headers: HashMap::new(),
        });
        assert!(build_transport(&config).is_err());
    }

    #[test]
    fn stdio_transport_builds() {
        let config = ServerConfig::new(TransportConfig::Stdio {
            command: "mcp-fs".into(),
            args: vec!["--root".into(), "/tmp".into()],
            env: HashMap::new(),
            cwd: None,
        });
        assert!(build_transport(&config).is_ok());
    }
}
