//! Sigmesh Configuration
//!
//! This module provides configuration structures for a Sigmesh node.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

use crate::crypto::{self, KeyPair};
use crate::signaling::SignalingConfig;

/// Main Sigmesh configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SigmeshConfig {
    /// Peer references
    #[serde(default)]
    pub peers: Vec<String>,

    /// Node-specific configuration
    pub node: NodeConfig,

    /// Relay and DNS configuration
    #[serde(default)]
    pub signaling: SignalingSection,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// How the tunnel device is provided
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TunMode {
    /// Kernel TUN device, needs privileges
    #[default]
    Kernel,
    /// Userspace network stack, no privileges needed
    Userspace,
}

impl TunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TunMode::Kernel => "kernel",
            TunMode::Userspace => "userspace",
        }
    }
}

impl std::fmt::Display for TunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Private key, 64 hex chars or base64
    pub private_key: String,

    /// UDP listen port for the tunnel engine (0 = any)
    #[serde(default)]
    pub listen_port: u16,

    /// Tunnel MTU
    #[serde(default = "default_mtu")]
    pub mtu: u32,

    /// Tunnel interface name
    #[serde(default = "default_tun")]
    pub tun: String,

    #[serde(default)]
    pub mode: TunMode,
}

/// Relay and DNS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalingSection {
    /// Relay links this node listens on
    #[serde(default)]
    pub links: Vec<String>,

    /// DNS over HTTPS server
    #[serde(default = "default_doh")]
    pub doh: String,

    /// Handshake and resolve deadline in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Pause between subscription attempts in milliseconds
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,

    /// Deadline for resolving all peers at startup in seconds
    #[serde(default = "default_resolve_timeout")]
    pub resolve_timeout_secs: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default value functions
fn default_mtu() -> u32 {
    // Two 1200 byte data channel messages minus overhead
    2 * 1200 - 80
}

fn default_tun() -> String {
    "sigmesh".to_string()
}

fn default_doh() -> String {
    crate::dns::DEFAULT_DOH_SERVER.to_string()
}

fn default_request_timeout() -> u64 {
    10
}

fn default_reconnect_interval_ms() -> u64 {
    1000
}

fn default_resolve_timeout() -> u64 {
    60
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for SignalingSection {
    fn default() -> Self {
        Self {
            links: Vec::new(),
            doh: default_doh(),
            request_timeout_secs: default_request_timeout(),
            reconnect_interval_ms: default_reconnect_interval_ms(),
            resolve_timeout_secs: default_resolve_timeout(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl NodeConfig {
    pub fn new(private_key: String) -> Self {
        Self {
            private_key,
            listen_port: 0,
            mtu: default_mtu(),
            tun: default_tun(),
            mode: TunMode::default(),
        }
    }
}

impl SigmeshConfig {
    /// Configuration with defaults around a private key
    pub fn new(private_key: String) -> Self {
        Self {
            peers: Vec::new(),
            node: NodeConfig::new(private_key),
            signaling: SignalingSection::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: SigmeshConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: SigmeshConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to TOML
    pub fn to_toml(&self) -> crate::Result<String> {
        toml::to_string_pretty(self).map_err(|e| crate::Error::Config(e.to_string()))
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        crypto::parse_key(&self.node.private_key)
            .map_err(|_| crate::Error::Config("node.private_key must be 32 bytes of hex or base64".into()))?;

        if self.node.tun.is_empty() {
            return Err(crate::Error::Config("node.tun cannot be empty".into()));
        }

        if self.node.mtu == 0 {
            return Err(crate::Error::Config("node.mtu must be positive".into()));
        }

        if self.signaling.request_timeout_secs == 0 {
            return Err(crate::Error::Config("signaling.request_timeout_secs must be positive".into()));
        }

        if self.signaling.reconnect_interval_ms == 0 {
            return Err(crate::Error::Config("signaling.reconnect_interval_ms must be positive".into()));
        }

        if self.signaling.resolve_timeout_secs == 0 {
            return Err(crate::Error::Config("signaling.resolve_timeout_secs must be positive".into()));
        }

        if self.signaling.doh.is_empty() {
            return Err(crate::Error::Config("signaling.doh cannot be empty".into()));
        }

        for link in &self.signaling.links {
            let url = Url::parse(link)
                .map_err(|e| crate::Error::Config(format!("invalid relay link {}: {}", link, e)))?;
            if url.scheme() != "http" && url.scheme() != "https" {
                return Err(crate::Error::Config(format!("relay link {} must be http or https", link)));
            }
        }

        Ok(())
    }

    /// Decode the node keypair
    pub fn keypair(&self) -> crate::Result<KeyPair> {
        KeyPair::parse(&self.node.private_key)
    }

    /// Get request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.signaling.request_timeout_secs)
    }

    /// Get reconnect interval as Duration
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.signaling.reconnect_interval_ms)
    }

    /// Get peer resolution deadline as Duration
    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_secs(self.signaling.resolve_timeout_secs)
    }

    /// Settings for the rendezvous client
    pub fn signaling_config(&self) -> SignalingConfig {
        SignalingConfig {
            request_timeout: self.request_timeout(),
            reconnect_interval: self.reconnect_interval(),
            ..SignalingConfig::default()
        }
    }
}
