//! Agent configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::serde_utils::duration_secs;
use crate::error::ConfigError;

/// Smallest RSA modulus accepted for agent identities
pub const MIN_KEY_BITS: usize = 2048;

/// Configuration for the publishing agent
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Local port of the service being published
    pub forward_port: u16,

    /// Local host the published service listens on
    pub bind_host: String,

    /// Proxy host the reverse tunnel connects to
    pub proxy_host: String,

    /// Username for SSH authentication at the proxy
    pub proxy_user: String,

    /// SSH port of the proxy
    pub proxy_port: u16,

    /// Base URL of the directory service
    pub directory_host: String,

    /// Domain the directory appends to node names
    pub service_domain: String,

    /// Root directory of the persistent key-value store
    pub store_path: PathBuf,

    /// Port on the proxy side targeted by the liveness forward
    pub health_port: u16,

    /// RSA modulus size for newly generated identities
    pub key_bits: usize,

    /// Bound on SSH connect and authentication
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,

    /// Bound on each directory HTTP request
    #[serde(with = "duration_secs")]
    pub http_timeout: Duration,

    /// SSH transport keepalive interval
    #[serde(with = "duration_secs")]
    pub keepalive_interval: Duration,

    /// How often the session loop checks whether it should keep running
    #[serde(with = "duration_secs")]
    pub poll_interval: Duration,

    /// Fixed waits applied by the reconnection state machine
    pub retry: RetryConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            forward_port: 80,
            bind_host: "127.0.0.1".to_string(),
            proxy_host: "proxy.protonet.info".to_string(),
            proxy_user: "localtunnel".to_string(),
            proxy_port: 22666,
            directory_host: "https://directory.protonet.info".to_string(),
            service_domain: "protonet.info".to_string(),
            store_path: super::default_config_dir().join("store"),
            health_port: 8765,
            key_bits: 4096,
            connect_timeout: Duration::from_secs(30),
            http_timeout: Duration::from_secs(30),
            keepalive_interval: Duration::from_secs(5),
            poll_interval: Duration::from_secs(1),
            retry: RetryConfig::default(),
        }
    }
}

impl AgentConfig {
    /// `bind_host:forward_port`, the address of the published service
    pub fn local_address(&self) -> String {
        format!("{}:{}", self.bind_host, self.forward_port)
    }

    /// Reject settings the agent must never run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.key_bits < MIN_KEY_BITS {
            return Err(ConfigError::Invalid(format!(
                "key_bits must be at least {}, got {}",
                MIN_KEY_BITS, self.key_bits
            )));
        }
        Ok(())
    }
}

/// Waits between attempts, one per failure class
///
/// None of these grow between attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// After the local service refused a connection
    #[serde(with = "duration_secs")]
    pub local_retry: Duration,

    /// After a directory failure
    #[serde(with = "duration_secs")]
    pub directory_retry: Duration,

    /// After the proxy rejected our key or the transport failed
    #[serde(with = "duration_secs")]
    pub auth_retry: Duration,

    /// After an established session dropped
    #[serde(with = "duration_secs")]
    pub reconnect_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            local_retry: Duration::from_secs(5),
            directory_retry: Duration::from_secs(30),
            auth_retry: Duration::from_secs(30),
            reconnect_delay: Duration::from_secs(1),
        }
    }
}
