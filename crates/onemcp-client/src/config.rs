//! Configuration for the outbound client.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use onemcp_protocol::{ClientCapabilities, Implementation};

/// Client configuration shared by all transports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Identity sent during the initialize handshake
    pub client_info: Implementation,

    /// Capabilities advertised to the upstream server
    #[serde(default)]
    pub capabilities: ClientCapabilities,

    /// Timeout configuration
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client_info: Implementation::new("onemcp-client", env!("CARGO_PKG_VERSION"))
                .with_title("1MCP Gateway"),
            capabilities: ClientCapabilities::default(),
            timeouts: TimeoutConfig::default(),
        }
    }
}

/// Timeouts applied by the client and its transports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Transport start / process spawn / TCP connect
    #[serde(with = "duration_ms")]
    pub connect: Duration,

    /// Per-request deadline; transports report this via `request_timeout()`
    #[serde(with = "duration_ms")]
    pub request: Duration,

    /// Initialize handshake deadline
    #[serde(with = "duration_ms")]
    pub initialization: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            request: Duration::from_secs(60),
            initialization: Duration::from_secs(15),
        }
    }
}

// Durations travel as integer milliseconds on the wire.
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
