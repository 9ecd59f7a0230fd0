//! # Client Configuration
//!
//! Purpose: Hold every knob the client core consumes in one explicit place:
//! server addresses, pool size, timeouts, TTL unit, protocol version,
//! credentials and the (opt-in) retry policy.
//!
//! ## Usage
//!
//! - `ClientConfig::builder()` for programmatic setup.
//! - `ClientConfig::from_json_str` / `ClientConfig::from_file` to load JSON.
//!   Missing fields fall back to `ClientConfig::default()`; durations are
//!   written in milliseconds (`read_timeout_ms`, `backoff_ms`, ...).

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::error::{ClientError, ClientResult};
use crate::transport::ConnectionConfig;

/// Unit used for every TTL the client sends or reads back.
///
/// This is the single switch between `EX`/`PX`, `EXPIRE`/`PEXPIRE` and
/// `TTL`/`PTTL`; call sites never pick a unit on their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TtlUnit {
    #[default]
    Seconds,
    Milliseconds,
}

impl TtlUnit {
    /// `SET` option carrying a relative expiry.
    pub fn set_option(self) -> &'static str {
        match self {
            TtlUnit::Seconds => "EX",
            TtlUnit::Milliseconds => "PX",
        }
    }

    pub fn expire_command(self) -> &'static str {
        match self {
            TtlUnit::Seconds => "EXPIRE",
            TtlUnit::Milliseconds => "PEXPIRE",
        }
    }

    pub fn ttl_command(self) -> &'static str {
        match self {
            TtlUnit::Seconds => "TTL",
            TtlUnit::Milliseconds => "PTTL",
        }
    }

    /// Converts a TTL into the integer sent on the wire.
    ///
    /// Rejects zero, values with a remainder below the unit (500ms in
    /// seconds mode would otherwise round silently) and values past `i64`.
    pub fn to_wire(self, ttl: Duration) -> ClientResult<i64> {
        let value = match self {
            TtlUnit::Seconds => {
                if ttl.subsec_nanos() != 0 {
                    return Err(ClientError::Encoding(format!(
                        "ttl {:?} is not a whole number of seconds",
                        ttl
                    )));
                }
                u128::from(ttl.as_secs())
            }
            TtlUnit::Milliseconds => {
                if ttl.subsec_nanos() % 1_000_000 != 0 {
                    return Err(ClientError::Encoding(format!(
                        "ttl {:?} is not a whole number of milliseconds",
                        ttl
                    )));
                }
                ttl.as_millis()
            }
        };
        if value == 0 {
            return Err(ClientError::Encoding("ttl must be greater than zero".to_string()));
        }
        i64::try_from(value)
            .map_err(|_| ClientError::Encoding(format!("ttl {:?} overflows the wire format", ttl)))
    }

    /// Converts a non-negative wire TTL back into a `Duration`.
    pub fn from_wire(self, value: i64) -> Duration {
        let value = value.max(0) as u64;
        match self {
            TtlUnit::Seconds => Duration::from_secs(value),
            TtlUnit::Milliseconds => Duration::from_millis(value),
        }
    }
}

/// Reply protocol requested on connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Plain RESP2, no handshake.
    #[default]
    Resp2,
    /// RESP3 via `HELLO 3`; hashes come back as `Reply::Map`.
    Resp3,
}

/// Bounded retry for connection failures.
///
/// Never applied by default: a retried `INCR` whose first attempt reached the
/// server would be counted twice.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Fixed pause between attempts.
    #[serde(rename = "backoff_ms", deserialize_with = "millis")]
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        RetryPolicy {
            max_attempts,
            backoff,
        }
    }
}

/// Configuration for the client, its pool and its connections.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server addresses, tried in order on connect, e.g. "127.0.0.1:6379".
    pub addrs: Vec<String>,
    /// Maximum idle connections kept in the pool.
    pub max_idle: usize,
    /// Maximum total connections (idle + in-use).
    pub max_total: usize,
    /// Optional TCP read timeout.
    #[serde(rename = "read_timeout_ms", deserialize_with = "opt_millis")]
    pub read_timeout: Option<Duration>,
    /// Optional TCP write timeout.
    #[serde(rename = "write_timeout_ms", deserialize_with = "opt_millis")]
    pub write_timeout: Option<Duration>,
    /// Optional TCP connect timeout.
    #[serde(rename = "connect_timeout_ms", deserialize_with = "opt_millis")]
    pub connect_timeout: Option<Duration>,
    /// How long a checkout waits for a free connection. `None` fails at once.
    #[serde(rename = "checkout_timeout_ms", deserialize_with = "opt_millis")]
    pub checkout_timeout: Option<Duration>,
    pub ttl_unit: TtlUnit,
    pub protocol: Protocol,
    /// Sent with `AUTH` (or `HELLO ... AUTH`) on every new connection.
    pub password: Option<String>,
    pub retry: Option<RetryPolicy>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            addrs: vec!["127.0.0.1:6379".to_string()],
            max_idle: 8,
            max_total: 16,
            read_timeout: None,
            write_timeout: None,
            connect_timeout: None,
            checkout_timeout: None,
            ttl_unit: TtlUnit::Seconds,
            protocol: Protocol::Resp2,
            password: None,
            retry: None,
        }
    }
}

impl ClientConfig {
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }

    /// Parses and validates a JSON configuration document.
    pub fn from_json_str(json: &str) -> ClientResult<Self> {
        let config: ClientConfig =
            serde_json::from_str(json).map_err(|err| ClientError::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> ClientResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|err| ClientError::Config(format!("{}: {}", path.display(), err)))?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> ClientResult<()> {
        if self.addrs.is_empty() {
            return Err(ClientError::Config("at least one address is required".to_string()));
        }
        if self.max_total == 0 {
            return Err(ClientError::Config("max_total must be greater than zero".to_string()));
        }
        if self.max_idle > self.max_total {
            return Err(ClientError::Config(format!(
                "max_idle ({}) exceeds max_total ({})",
                self.max_idle, self.max_total
            )));
        }
        if let Some(retry) = &self.retry {
            if retry.max_attempts == 0 {
                return Err(ClientError::Config(
                    "retry.max_attempts must be at least 1".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// The per-connection subset handed to the transport.
    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            addrs: self.addrs.clone(),
            read_timeout: self.read_timeout,
            write_timeout: self.write_timeout,
            connect_timeout: self.connect_timeout,
            protocol: self.protocol,
            password: self.password.clone(),
        }
    }
}

/// Builder for `ClientConfig`.
#[derive(Default)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    /// Replaces the address list with a single address.
    pub fn addr(mut self, addr: impl Into<String>) -> Self {
        self.config.addrs = vec![addr.into()];
        self
    }

    /// Appends a fallback address.
    pub fn fallback_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.addrs.push(addr.into());
        self
    }

    pub fn max_idle(mut self, count: usize) -> Self {
        self.config.max_idle = count;
        self
    }

    pub fn max_total(mut self, count: usize) -> Self {
        self.config.max_total = count;
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_timeout = Some(timeout);
        self
    }

    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.config.write_timeout = Some(timeout);
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = Some(timeout);
        self
    }

    pub fn checkout_timeout(mut self, timeout: Duration) -> Self {
        self.config.checkout_timeout = Some(timeout);
        self
    }

    pub fn ttl_unit(mut self, unit: TtlUnit) -> Self {
        self.config.ttl_unit = unit;
        self
    }

    pub fn protocol(mut self, protocol: Protocol) -> Self {
        self.config.protocol = protocol;
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.config.password = Some(password.into());
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.config.retry = Some(policy);
        self
    }

    pub fn build(self) -> ClientResult<ClientConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

fn millis<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    u64::deserialize(deserializer).map(Duration::from_millis)
}

fn opt_millis<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
    Option::<u64>::deserialize(deserializer).map(|value| value.map(Duration::from_millis))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn json_overrides_defaults() {
        let config = ClientConfig::from_json_str(
            r#"{
                "addrs": ["10.0.0.1:6379", "10.0.0.2:6379"],
                "max_total": 4,
                "max_idle": 2,
                "read_timeout_ms": 250,
                "ttl_unit": "milliseconds",
                "protocol": "resp3",
                "retry": { "max_attempts": 3, "backoff_ms": 10 }
            }"#,
        )
        .unwrap();

        assert_eq!(config.addrs.len(), 2);
        assert_eq!(config.max_total, 4);
        assert_eq!(config.read_timeout, Some(Duration::from_millis(250)));
        assert_eq!(config.write_timeout, None);
        assert_eq!(config.ttl_unit, TtlUnit::Milliseconds);
        assert_eq!(config.protocol, Protocol::Resp3);
        assert_eq!(config.retry, Some(RetryPolicy::new(3, Duration::from_millis(10))));
    }

    #[test]
    fn empty_document_is_default() {
        let config = ClientConfig::from_json_str("{}").unwrap();
        assert_eq!(config.addrs, vec!["127.0.0.1:6379".to_string()]);
        assert_eq!(config.ttl_unit, TtlUnit::Seconds);
        assert!(config.retry.is_none());
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "addrs": ["127.0.0.1:7000"], "password": "secret" }}"#).unwrap();
        let config = ClientConfig::from_file(file.path()).unwrap();
        assert_eq!(config.addrs, vec!["127.0.0.1:7000".to_string()]);
        assert_eq!(config.password.as_deref(), Some("secret"));
    }

    #[test]
    fn rejects_invalid_settings() {
        assert!(ClientConfig::builder().max_total(0).build().is_err());
        assert!(ClientConfig::builder().max_total(2).max_idle(3).build().is_err());
        assert!(ClientConfig::builder()
            .retry(RetryPolicy::new(0, Duration::ZERO))
            .build()
            .is_err());
        assert!(matches!(
            ClientConfig::from_json_str(r#"{ "addrs": [] }"#),
            Err(ClientError::Config(_))
        ));
    }

    #[test]
    fn ttl_unit_conversion() {
        assert_eq!(TtlUnit::Seconds.to_wire(Duration::from_secs(10)).unwrap(), 10);
        assert_eq!(TtlUnit::Milliseconds.to_wire(Duration::from_secs(10)).unwrap(), 10_000);
        assert!(matches!(
            TtlUnit::Seconds.to_wire(Duration::from_millis(1500)),
            Err(ClientError::Encoding(_))
        ));
        assert!(matches!(
            TtlUnit::Milliseconds.to_wire(Duration::ZERO),
            Err(ClientError::Encoding(_))
        ));
        assert_eq!(TtlUnit::Milliseconds.from_wire(1500), Duration::from_millis(1500));
    }
}
