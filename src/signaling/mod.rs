//! Signaling Module
//!
//! Exchanges session descriptions with remote peers through HTTP relays.
//! Outbound offers are POSTed to the peer's relay link; inbound offers arrive
//! on a server-sent event stream per relay and are answered with a DELETE.

pub mod sign;
pub mod reconnect;
pub mod sse;
mod client;

pub use client::{RelaySession, RendezvousClient, SignalingConfig};
pub use reconnect::ReconnectPolicy;
pub use sign::sign_url;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Header carrying the event id when answering an inbound offer
pub const EVENT_ID_HEADER: &str = "X-Event-Id";

/// Capacity of the inbound offer queue shared by all relays
pub const INBOUND_QUEUE_CAPACITY: usize = 512;

/// Kind of a session description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Pranswer,
    Answer,
    Rollback,
}

/// Session description produced and consumed by the WebRTC engine
///
/// The `sdp` body is opaque to signaling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    #[serde(default)]
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self { kind: SdpType::Offer, sdp: sdp.into() }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self { kind: SdpType::Answer, sdp: sdp.into() }
    }
}

/// An inbound offer waiting for an answer
#[async_trait::async_trait]
pub trait Session: Send + Sync {
    /// Correlation token assigned by the relay
    fn id(&self) -> &str;

    /// The remote offer
    fn description(&self) -> &SessionDescription;

    /// Deliver the answer to the offering peer
    async fn resolve(&self, answer: &SessionDescription) -> Result<()>;

    /// Give up on the offer
    fn reject(&self, reason: &Error);
}

/// Signaling channel used by the WebRTC engine
#[async_trait::async_trait]
pub trait Channel: Send + Sync {
    type Session: Session + 'static;

    /// Send an offer to `endpoint` and wait for the answer
    async fn handshake(&self, endpoint: &str, offer: &SessionDescription) -> Result<SessionDescription>;

    /// Start receiving offers
    async fn accept(&self) -> Result<tokio_stream::wrappers::ReceiverStream<Self::Session>>;

    /// Stop receiving offers and wait for background work to finish
    async fn close(&self);
}
