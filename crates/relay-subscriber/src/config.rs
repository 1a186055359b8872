//! Subscriber configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for the subscriber role.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubscriberConfig {
    /// Hub WebSocket URL. `clientId` is appended on every dial.
    pub server_url: String,
    /// First reconnect delay in milliseconds.
    pub backoff_initial_ms: u64,
    /// Upper bound on the reconnect delay in milliseconds.
    pub backoff_max_ms: u64,
    /// Random spread applied to each delay, as a fraction (0.0 disables).
    pub backoff_jitter: f64,
    /// How long a dial may take before it counts as failed.
    pub connect_timeout_ms: u64,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://localhost:8080/ws".into(),
            backoff_initial_ms: 5_000,
            backoff_max_ms: 60_000,
            backoff_jitter: 0.0,
            connect_timeout_ms: 10_000,
        }
    }
}

impl SubscriberConfig {
    pub fn with_server_url(url: impl Into<String>) -> Self {
        Self {
            server_url: url.into(),
            ..Self::default()
        }
    }

    pub fn backoff_initial(&self) -> Duration {
        Duration::from_millis(self.backoff_initial_ms)
    }

    /// Never below the initial delay.
    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms.max(self.backoff_initial_ms))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = SubscriberConfig::default();
        assert_eq!(cfg.server_url, "ws://localhost:8080/ws");
        assert_eq!(cfg.backoff_initial(), Duration::from_secs(5));
        assert_eq!(cfg.backoff_max(), Duration::from_secs(60));
        assert!(cfg.backoff_jitter.abs() < f64::EPSILON);
    }

    #[test]
    fn max_never_below_initial() {
        let cfg = SubscriberConfig {
            backoff_initial_ms: 2_000,
            backoff_max_ms: 500,
            ..SubscriberConfig::default()
        };
        assert_eq!(cfg.backoff_max(), Duration::from_secs(2));
    }

    #[test]
    fn with_server_url_keeps_other_defaults() {
        let cfg = SubscriberConfig::with_server_url("ws://hub:9999/ws");
        assert_eq!(cfg.server_url, "ws://hub:9999/ws");
        assert_eq!(cfg.backoff_initial_ms, 5_000);
    }
}
