//! Tunnel device configuration
//!
//! Renders the newline-delimited `key=value` protocol the tunnel engine
//! accepts through its configuration channel.

use std::fmt;

use crate::address::Prefix;
use crate::peer::ResolvedPeer;

/// Interface section
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    /// Private key as hex
    pub private_key: String,
    pub listen_port: u16,
}

impl fmt::Display for DeviceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "private_key={}", self.private_key)?;
        writeln!(f, "listen_port={}", self.listen_port)
    }
}

/// Peer section
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerConfig {
    /// Public key as hex
    pub public_key: String,
    pub preshared_key: Option<String>,
    pub allowed_ips: Vec<Prefix>,
    pub endpoint: Option<String>,
    pub persistent_keepalive: Option<String>,
}

impl fmt::Display for PeerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "public_key={}", self.public_key)?;
        if let Some(psk) = non_empty(&self.preshared_key) {
            writeln!(f, "preshared_key={}", psk)?;
        }
        for ip in &self.allowed_ips {
            writeln!(f, "allowed_ip={}", ip)?;
        }
        if let Some(endpoint) = non_empty(&self.endpoint) {
            writeln!(f, "endpoint={}", endpoint)?;
        }
        if let Some(keepalive) = non_empty(&self.persistent_keepalive) {
            writeln!(f, "persistent_keepalive_interval={}", keepalive)?;
        }
        Ok(())
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

impl From<&ResolvedPeer> for PeerConfig {
    fn from(peer: &ResolvedPeer) -> Self {
        Self {
            public_key: peer.public_hex(),
            preshared_key: peer.preshared_hex(),
            allowed_ips: vec![peer.allowed_ip],
            endpoint: peer.endpoint.clone(),
            persistent_keepalive: peer.keepalive.clone(),
        }
    }
}

/// Concatenated peer sections for one configuration call
pub fn render_peers<'a>(peers: impl IntoIterator<Item = &'a ResolvedPeer>) -> String {
    peers
        .into_iter()
        .map(|peer| PeerConfig::from(peer).to_string())
        .collect()
}
