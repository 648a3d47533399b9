//! Server configuration.

use std::time::Duration;

use tandem_core::config::BridgeConfig;

/// Bridge server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Per-connection wait for the close handshake on stop.
    pub close_timeout: Duration,

    /// Outbound frames buffered per client before it is dropped as dead.
    pub client_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            close_timeout: Duration::from_secs(1),
            client_buffer: 256,
        }
    }
}

impl ServerConfig {
    pub fn from_bridge(bridge: &BridgeConfig) -> Self {
        Self {
            close_timeout: bridge.close_timeout(),
            client_buffer: bridge.client_buffer.max(1),
        }
    }

    #[must_use]
    pub const fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_client_buffer(mut self, frames: usize) -> Self {
        self.client_buffer = frames.max(1);
        self
    }
}
