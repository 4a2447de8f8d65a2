//! Configuration for the node and its WebSocket transport.

use serde::Deserialize;
use std::time::Duration;

/// Node configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    /// Name reported in logs and diagnostics.
    pub name: String,

    /// Version string sent to clients in the connect reply.
    pub version: String,

    /// How long per-channel history metadata (offset counters) survives
    /// after the last publication before being dropped.
    #[serde(deserialize_with = "crate::utils::deserialize_duration")]
    pub history_meta_ttl: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            name: "channelhub".to_string(),
            version: "0.0.0".to_string(),
            history_meta_ttl: Duration::from_secs(30 * 24 * 3600),
        }
    }
}

/// WebSocket transport configuration.
///
/// tungstenite only exposes write-side buffering, so the buffer knob here
/// controls the outgoing frame buffer.
#[derive(Debug, Clone, Deserialize)]
pub struct WebSocketConfig {
    /// Outgoing frame buffer size in bytes.
    pub write_buffer_size: usize,

    /// Upper bound for a single inbound message.
    pub max_message_size: usize,

    /// How long a freshly upgraded transport may wait before sending its
    /// connect command.
    #[serde(deserialize_with = "crate::utils::deserialize_duration")]
    pub handshake_timeout: Duration,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        WebSocketConfig {
            write_buffer_size: 1024,
            max_message_size: 64 * 1024,
            handshake_timeout: Duration::from_secs(10),
        }
    }
}
