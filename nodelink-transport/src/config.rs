//! Transport configuration.
//!
//! [`ConnectionProperties`] maps directly to the `[server]` and `[client]`
//! sections of the TOML config file. [`TransportConfig`] is the resolved
//! form with `Duration`s and the internal timeouts, produced via
//! `TryFrom<ConnectionProperties>`.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration validation and loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Read {
        /// Path that was read.
        path: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The config file is not valid TOML for [`ConnectionProperties`].
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Keepalive timeout must be strictly greater than the interval.
    #[error("keepalive timeout ({timeout:?}) must be greater than keepalive interval ({interval:?})")]
    KeepaliveTimeoutTooShort {
        /// Configured probe interval.
        interval: Duration,
        /// Configured timeout.
        timeout: Duration,
    },

    /// A duration that drives a loop or a backoff is zero.
    #[error("{field} must be non-zero")]
    ZeroDuration {
        /// Name of the offending field.
        field: &'static str,
    },
}

/// Raw connection configuration as deserialized from TOML.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionProperties {
    /// Listening side.
    #[serde(default)]
    pub server: ServerProperties,
    /// Dialing side.
    #[serde(default)]
    pub client: ClientProperties,
}

/// Listening endpoint settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerProperties {
    /// Host to bind.
    #[serde(default = "default_host")]
    pub host: String,
    /// First port to try.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Try the following ports when `port` is taken.
    #[serde(default)]
    pub port_auto_increment: bool,
    /// How many extra ports auto-increment may try after `port`.
    #[serde(default = "default_port_count")]
    pub port_count: u16,
    /// Require secured streams for inbound connections.
    #[serde(default)]
    pub security_enabled: bool,
}

/// Dialing side settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientProperties {
    /// Require secured streams for outbound connections.
    #[serde(default)]
    pub security_enabled: bool,
    /// Probe a pooled peer after this much silence.
    #[serde(default = "default_keepalive_interval_seconds")]
    pub keepalive_interval_seconds: u32,
    /// Drop a pooled peer after this much silence.
    #[serde(default = "default_keepalive_timeout_seconds")]
    pub keepalive_timeout_seconds: u32,
    /// Delay before re-dialing a peer whose connection closed.
    #[serde(default = "default_reconnect_interval_seconds")]
    pub reconnect_interval_seconds: u32,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    7510
}

fn default_port_count() -> u16 {
    100
}

fn default_keepalive_interval_seconds() -> u32 {
    5
}

fn default_keepalive_timeout_seconds() -> u32 {
    15
}

fn default_reconnect_interval_seconds() -> u32 {
    15
}

impl Default for ServerProperties {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            port_auto_increment: false,
            port_count: default_port_count(),
            security_enabled: false,
        }
    }
}

impl Default for ClientProperties {
    fn default() -> Self {
        Self {
            security_enabled: false,
            keepalive_interval_seconds: default_keepalive_interval_seconds(),
            keepalive_timeout_seconds: default_keepalive_timeout_seconds(),
            reconnect_interval_seconds: default_reconnect_interval_seconds(),
        }
    }
}

impl ConnectionProperties {
    /// Parse properties from a TOML document.
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(input)?)
    }

    /// Read and parse a TOML config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let input = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&input)
    }
}

/// Resolved transport configuration used by [`crate::TransportManager`].
#[derive(Debug, Clone, PartialEq)]
pub struct TransportConfig {
    /// Host to bind.
    pub host: String,
    /// First port to try.
    pub port: u16,
    /// Try the following ports when `port` is taken.
    pub port_auto_increment: bool,
    /// Extra ports auto-increment may try (`port ..= port + port_count`).
    pub port_count: u16,
    /// Inbound connections must be secured.
    pub server_security: bool,
    /// Outbound connections must be secured.
    pub client_security: bool,

    /// Probe a pooled dialing-side connection after this much silence.
    pub keepalive_interval: Duration,
    /// Force-close a pooled dialing-side connection after this much silence.
    pub keepalive_timeout: Duration,
    /// How often the keepalive loop scans the pool.
    pub keepalive_tick: Duration,
    /// Delay before re-dialing after a dialing-side connection closed.
    pub reconnect_interval: Duration,
    /// Dial failure backoff grows by this much per consecutive failure.
    pub retry_backoff_step: Duration,
    /// Upper bound of the dial failure backoff.
    pub retry_backoff_max: Duration,

    /// Bound on binding the listening socket.
    pub bind_timeout: Duration,
    /// Bound on establishing an outbound TCP connection.
    pub connect_timeout: Duration,
    /// Bound on the Open handshake round trip.
    pub handshake_timeout: Duration,
    /// Bound on the Close handshake round trip during shutdown.
    pub close_handshake_timeout: Duration,
    /// Bound on an application request round trip.
    pub request_timeout: Duration,
    /// How long disposal waits for the accept loop to finish.
    pub dispose_grace: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            port_auto_increment: false,
            port_count: default_port_count(),
            server_security: false,
            client_security: false,
            keepalive_interval: Duration::from_secs(5),
            keepalive_timeout: Duration::from_secs(15),
            keepalive_tick: Duration::from_secs(1),
            reconnect_interval: Duration::from_secs(15),
            retry_backoff_step: Duration::from_secs(10),
            retry_backoff_max: Duration::from_secs(60),
            bind_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(5),
            close_handshake_timeout: Duration::from_secs(3),
            request_timeout: Duration::from_secs(10),
            dispose_grace: Duration::from_secs(1),
        }
    }
}

impl TryFrom<ConnectionProperties> for TransportConfig {
    type Error = ConfigError;

    fn try_from(properties: ConnectionProperties) -> Result<Self, Self::Error> {
        let server = properties.server;
        let client = properties.client;
        let config = TransportConfig {
            host: server.host,
            port: server.port,
            port_auto_increment: server.port_auto_increment,
            port_count: server.port_count,
            server_security: server.security_enabled,
            client_security: client.security_enabled,
            keepalive_interval: Duration::from_secs(u64::from(client.keepalive_interval_seconds)),
            keepalive_timeout: Duration::from_secs(u64::from(client.keepalive_timeout_seconds)),
            reconnect_interval: Duration::from_secs(u64::from(client.reconnect_interval_seconds)),
            ..TransportConfig::default()
        };
        config.validate()?;
        Ok(config)
    }
}

impl TransportConfig {
    /// Listen on `host:port`.
    pub fn with_listen(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = host.into();
        self.port = port;
        self
    }

    /// Enable port auto-increment over `port_count` extra ports.
    pub fn with_port_auto_increment(mut self, port_count: u16) -> Self {
        self.port_auto_increment = true;
        self.port_count = port_count;
        self
    }

    /// Set keepalive probe interval and timeout.
    pub fn with_keepalive(mut self, interval: Duration, timeout: Duration) -> Self {
        self.keepalive_interval = interval;
        self.keepalive_timeout = timeout;
        self
    }

    /// Set how often the keepalive loop scans the pool.
    pub fn with_keepalive_tick(mut self, tick: Duration) -> Self {
        self.keepalive_tick = tick;
        self
    }

    /// Set the delay before re-dialing a closed dialing-side connection.
    pub fn with_reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    /// Set the linear dial failure backoff and its cap.
    pub fn with_retry_backoff(mut self, step: Duration, max: Duration) -> Self {
        self.retry_backoff_step = step;
        self.retry_backoff_max = max;
        self
    }

    /// Set connect, handshake and close handshake timeouts at once.
    pub fn with_round_trip_timeouts(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self.handshake_timeout = timeout;
        self.close_handshake_timeout = timeout;
        self
    }

    /// Set the application request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Require secured streams on the listening and dialing sides.
    pub fn with_security(mut self, server: bool, client: bool) -> Self {
        self.server_security = server;
        self.client_security = client;
        self
    }

    /// Whether either side requires secured streams.
    pub fn requires_security(&self) -> bool {
        self.server_security || self.client_security
    }

    /// Backoff after `failures` consecutive dial failures:
    /// `min(failures * retry_backoff_step, retry_backoff_max)`.
    pub fn retry_delay(&self, failures: u32) -> Duration {
        self.retry_backoff_step
            .saturating_mul(failures)
            .min(self.retry_backoff_max)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("keepalive_interval", self.keepalive_interval),
            ("keepalive_tick", self.keepalive_tick),
            ("retry_backoff_step", self.retry_backoff_step),
        ] {
            if value.is_zero() {
                return Err(ConfigError::ZeroDuration { field });
            }
        }
        if self.keepalive_timeout <= self.keepalive_interval {
            return Err(ConfigError::KeepaliveTimeoutTooShort {
                interval: self.keepalive_interval,
                timeout: self.keepalive_timeout,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TransportConfig::try_from(ConnectionProperties::default()).expect("valid");
        assert_eq!(config.port, 7510);
        assert_eq!(config.keepalive_interval, Duration::from_secs(5));
        assert_eq!(config.keepalive_timeout, Duration::from_secs(15));
        assert_eq!(config.reconnect_interval, Duration::from_secs(15));
        assert!(!config.port_auto_increment);
    }

    #[test]
    fn test_parse_toml() {
        let properties = ConnectionProperties::from_toml_str(
            r#"
            [server]
            host = "127.0.0.1"
            port = 7000
            port_auto_increment = true
            port_count = 3

            [client]
            keepalive_interval_seconds = 2
            keepalive_timeout_seconds = 6
            "#,
        )
        .expect("parse");

        let config = TransportConfig::try_from(properties).expect("valid");
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 7000);
        assert!(config.port_auto_increment);
        assert_eq!(config.port_count, 3);
        assert_eq!(config.keepalive_interval, Duration::from_secs(2));
        assert_eq!(config.keepalive_timeout, Duration::from_secs(6));
        assert_eq!(config.reconnect_interval, Duration::from_secs(15));
    }

    #[test]
    fn test_keepalive_timeout_must_exceed_interval() {
        let properties = ConnectionProperties::from_toml_str(
            r#"
            [client]
            keepalive_interval_seconds = 10
            keepalive_timeout_seconds = 10
            "#,
        )
        .expect("parse");

        assert!(matches!(
            TransportConfig::try_from(properties),
            Err(ConfigError::KeepaliveTimeoutTooShort { .. })
        ));
    }

    #[test]
    fn test_zero_tick_rejected() {
        let config = TransportConfig::default().with_keepalive_tick(Duration::ZERO);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ZeroDuration {
                field: "keepalive_tick"
            })
        ));
    }

    #[test]
    fn test_unknown_toml_type_is_parse_error() {
        let result = ConnectionProperties::from_toml_str("[server]\nport = \"high\"\n");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_retry_delay_is_capped_linear() {
        let config = TransportConfig::default();
        assert_eq!(config.retry_delay(1), Duration::from_secs(10));
        assert_eq!(config.retry_delay(3), Duration::from_secs(30));
        assert_eq!(config.retry_delay(6), Duration::from_secs(60));
        assert_eq!(config.retry_delay(50), Duration::from_secs(60));
    }

    #[test]
    fn test_builders() {
        let config = TransportConfig::default()
            .with_listen("127.0.0.1", 0)
            .with_port_auto_increment(3)
            .with_keepalive(Duration::from_millis(50), Duration::from_millis(200))
            .with_security(true, false);
        assert_eq!(config.port, 0);
        assert_eq!(config.port_count, 3);
        assert!(config.requires_security());
        assert!(config.validate().is_ok());
    }
}
