//! Reference server configuration.

use std::time::Duration;

/// Default interval between active expiration passes.
pub const DEFAULT_PURGE_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen address; port 0 picks an ephemeral port.
    pub addr: String,
    /// When set, clients must `AUTH` (or `HELLO ... AUTH`) before anything else.
    pub password: Option<String>,
    pub purge_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:6379".to_string(),
            password: None,
            purge_interval: DEFAULT_PURGE_INTERVAL,
        }
    }
}

impl ServerConfig {
    /// Config bound to an ephemeral localhost port, as tests use it.
    pub fn ephemeral() -> Self {
        Self {
            addr: "127.0.0.1:0".to_string(),
            ..Self::default()
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_purge_interval(mut self, interval: Duration) -> Self {
        self.purge_interval = interval;
        self
    }
}
