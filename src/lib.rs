//! Sigmesh - Peer-to-peer VPN rendezvous
//!
//! Nodes find each other without a coordinator: handshakes travel through
//! third-party HTTP relays and every node's overlay address is derived from
//! its public key.
//!
//! # Architecture
//!
//! - [`signaling`] exchanges session descriptions through relays, outbound
//!   as signed POSTs and inbound over one event stream per relay.
//! - [`address`] maps a public key to its address in `fdd9:f800::/24`.
//! - [`peer`] resolves configured peer references, looking up DNS over
//!   HTTPS ([`dns`]) when a reference names a domain.
//! - [`bind`] watches the data path and forces a rehandshake when a link dies.
//! - [`node`] wires these to the tunnel engine and the network interface.

pub mod address;
pub mod bind;
pub mod config;
pub mod crypto;
pub mod device;
pub mod dns;
pub mod error;
pub mod node;
pub mod peer;
pub mod signaling;

pub use config::SigmeshConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::address::{derive, Prefix, OVERLAY_NETWORK};
    pub use crate::bind::{AdaptiveBind, Bind, Endpoint};
    pub use crate::config::{SigmeshConfig, TunMode};
    pub use crate::crypto::KeyPair;
    pub use crate::error::{Error, Result};
    pub use crate::node::{Node, Platform, TunnelEngine};
    pub use crate::peer::{PeerResolver, ResolvedPeer};
    pub use crate::signaling::{Channel, RendezvousClient, Session, SessionDescription};
}
