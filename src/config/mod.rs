//! Configuration management.
//!
//! Supports configuration from:
//! - TOML config files
//! - Environment variables
//! - Programmatic construction
//!
//! A [`SessionConfig`] is passed explicitly into
//! [`Session::new`](crate::session::Session::new); there is no
//! process-wide mutable default.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

/// Main configuration struct
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Domain of the remote server (the `to` of the stream header).
    pub domain: String,

    /// Transport candidates tried in order during `connect()`.
    #[serde(default)]
    pub transports: Vec<TransportCandidate>,

    /// Default timeout for `connect()` and `login()` in seconds.
    pub connect_timeout_secs: u64,

    /// Default timeout for synchronous queries in seconds.
    pub query_timeout_secs: u64,

    /// Reconnection policy parameters.
    #[serde(default)]
    pub reconnect: ReconnectConfig,

    /// BOSH transport parameters.
    #[serde(default)]
    pub bosh: BoshConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            domain: String::new(),
            transports: Vec::new(),
            connect_timeout_secs: 30,
            query_timeout_secs: 10,
            reconnect: ReconnectConfig::default(),
            bosh: BoshConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Create a configuration for the given domain with defaults.
    pub fn for_domain(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            ..Self::default()
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let content = std::fs::read_to_string(&path)
            .map_err(|e| Error::Config(format!("Failed to read config file: {e}")))?;

        toml::from_str(&content).map_err(|e| Error::Config(format!("Failed to parse config: {e}")))
    }

    /// Load overrides from environment variables on top of `self`.
    pub fn with_env(mut self) -> Self {
        if let Ok(domain) = std::env::var("XYLO_DOMAIN") {
            self.domain = domain;
        }
        if let Ok(val) = std::env::var("XYLO_CONNECT_TIMEOUT_SECS") {
            if let Ok(val) = val.parse() {
                self.connect_timeout_secs = val;
            }
        }
        if let Ok(val) = std::env::var("XYLO_QUERY_TIMEOUT_SECS") {
            if let Ok(val) = val.parse() {
                self.query_timeout_secs = val;
            }
        }
        self
    }

    /// Default timeout for `connect()`/`login()`.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Default timeout for `query()`.
    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }
}

/// One entry in the ordered transport candidate list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TransportCandidate {
    /// Persistent stream over TCP.
    Tcp {
        /// Host to connect to.
        host: String,
        /// Port to connect to.
        port: u16,
    },
    /// Reliable long-polling HTTP binding.
    Bosh {
        /// Connection manager URL.
        url: String,
    },
}

/// Reconnection policy parameters (truncated binary exponential backoff).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Automatically reconnect after connection-level failures.
    pub enabled: bool,

    /// Slot time in seconds: attempt `n` delays uniformly in
    /// `[0, (2^n - 1) * slot)`.
    pub slot_secs: u64,

    /// Ceiling on the exponent; attempts beyond it keep the same
    /// delay distribution.
    pub ceiling: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            slot_secs: 2,
            ceiling: 5,
        }
    }
}

/// BOSH transport parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoshConfig {
    /// Requested number of requests the server may hold open.
    pub hold: u8,

    /// Requested maximum seconds the server may delay a response.
    pub wait: u16,

    /// Delay before an empty long-poll request is actually sent, giving
    /// the application a window to piggyback data.
    pub poll_delay_ms: u64,

    /// Enable the key sequence (request replay protection).
    pub use_key_sequence: bool,
}

impl Default for BoshConfig {
    fn default() -> Self {
        Self {
            hold: 1,
            wait: 60,
            poll_delay_ms: 100,
            use_key_sequence: true,
        }
    }
}

impl BoshConfig {
    /// Piggyback window before an empty poll goes out.
    pub fn poll_delay(&self) -> Duration {
        Duration::from_millis(self.poll_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SessionConfig::for_domain("example.org");
        assert_eq!(config.domain, "example.org");
        assert_eq!(config.connect_timeout_secs, 30);
        assert_eq!(config.bosh.hold, 1);
        assert!(config.reconnect.enabled);
    }

    #[test]
    fn test_config_from_toml() {
        let toml = r#"
            domain = "example.org"
            connect_timeout_secs = 15
            query_timeout_secs = 5

            [[transports]]
            kind = "tcp"
            host = "xmpp.example.org"
            port = 5222

            [[transports]]
            kind = "bosh"
            url = "https://example.org/http-bind"

            [reconnect]
            enabled = true
            slot_secs = 3
            ceiling = 4

            [bosh]
            hold = 2
            wait = 30
            poll_delay_ms = 50
            use_key_sequence = false
        "#;

        let config: SessionConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.domain, "example.org");
        assert_eq!(config.transports.len(), 2);
        assert_eq!(
            config.transports[0],
            TransportCandidate::Tcp {
                host: "xmpp.example.org".to_string(),
                port: 5222
            }
        );
        assert_eq!(config.reconnect.ceiling, 4);
        assert_eq!(config.bosh.wait, 30);
        assert!(!config.bosh.use_key_sequence);
    }
}
