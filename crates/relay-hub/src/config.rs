//! Hub configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for the hub role.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HubConfig {
    /// Host to bind (default `"0.0.0.0"`).
    pub host: String,
    /// Port to bind (default `9999`, `0` for auto-assign).
    pub port: u16,
    /// Path of the WebSocket endpoint.
    pub path: String,
    /// Seconds between broadcast rounds.
    pub broadcast_interval_secs: u64,
    /// Seconds a peer has to acknowledge a round.
    pub ack_timeout_secs: u64,
    /// Outbound frames buffered per peer before a send counts as failed.
    pub max_send_queue: usize,
    /// Seconds between keepalive pings to each peer.
    pub heartbeat_interval_secs: u64,
    /// Max inbound WebSocket message size in bytes.
    pub max_message_size: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 9999,
            path: "/ws".into(),
            broadcast_interval_secs: 10,
            ack_timeout_secs: 5,
            max_send_queue: 256,
            heartbeat_interval_secs: 30,
            max_message_size: 1024 * 1024,
        }
    }
}

impl HubConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn broadcast_interval(&self) -> Duration {
        Duration::from_secs(self.broadcast_interval_secs.max(1))
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.ack_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }
}
