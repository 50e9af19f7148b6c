//! Adaptive Bind
//!
//! Wraps the data-plane transport and watches send results per destination.
//! The first failed send to a destination expires the peer's session keys so
//! the tunnel engine starts a new handshake; further failures are ignored
//! until a send succeeds again.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use tokio::sync::mpsc;
use tracing::{debug, warn};
use url::Url;

use crate::crypto::{parse_hex_key, KEY_LEN};
use crate::error::{Error, Result};

/// Destination of a datagram
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// A link we dialled; its fragment carries the peer's hex public key
    Outbound(String),
    /// A session a peer opened to us
    Inbound(String),
}

impl Endpoint {
    pub fn dst(&self) -> &str {
        match self {
            Endpoint::Outbound(dst) | Endpoint::Inbound(dst) => dst,
        }
    }
}

/// Raw datagram transport
pub trait Bind: Send + Sync {
    fn send(&self, bufs: &[&[u8]], endpoint: &Endpoint) -> Result<()>;
}

/// Part of the tunnel engine that can drop a peer's current session keys
pub trait KeypairExpirer: Send + Sync {
    fn expire_current_keypairs(&self, public_key: &[u8; KEY_LEN]) -> Result<()>;
}

/// Per-destination "awaiting rehandshake" marks
#[derive(Debug, Default)]
pub(crate) struct LivenessMap {
    marks: HashMap<String, bool>,
}

impl LivenessMap {
    /// Record a send result; true when the peer's keys should be expired
    pub(crate) fn observe(&mut self, dst: &str, ok: bool) -> bool {
        if ok {
            if let Some(mark) = self.marks.get_mut(dst) {
                *mark = false;
            }
            return false;
        }

        let mark = self.marks.entry(dst.to_string()).or_insert(false);
        if *mark {
            return false;
        }
        *mark = true;
        true
    }
}

struct Outcome {
    dst: String,
    ok: bool,
}

/// [`Bind`] wrapper that forces rehandshakes on dead links
pub struct AdaptiveBind<B> {
    inner: B,
    outcomes: mpsc::UnboundedSender<Outcome>,
    engine: Arc<OnceLock<Arc<dyn KeypairExpirer>>>,
}

impl<B: Bind> AdaptiveBind<B> {
    /// Wrap `inner`; must be called inside a tokio runtime
    pub fn new(inner: B) -> Self {
        let (outcomes, rx) = mpsc::unbounded_channel();
        let engine = Arc::new(OnceLock::new());
        tokio::spawn(watch(rx, Arc::clone(&engine)));
        Self { inner, outcomes, engine }
    }

    /// Attach the engine whose keypairs get expired
    ///
    /// Send results seen before this are not tracked.
    pub fn attach(&self, engine: Arc<dyn KeypairExpirer>) -> Result<()> {
        self.engine
            .set(engine)
            .map_err(|_| Error::Engine("adaptive bind already attached".into()))
    }
}

impl<B: Bind> Bind for AdaptiveBind<B> {
    fn send(&self, bufs: &[&[u8]], endpoint: &Endpoint) -> Result<()> {
        let result = self.inner.send(bufs, endpoint);
        if self.engine.get().is_none() {
            return result;
        }
        if let Endpoint::Outbound(dst) = endpoint {
            // The watcher only stops once this bind is dropped
            let _ = self.outcomes.send(Outcome {
                dst: dst.clone(),
                ok: result.is_ok(),
            });
        }
        result
    }
}

/// Apply send outcomes in the order they happened
async fn watch(mut rx: mpsc::UnboundedReceiver<Outcome>, engine: Arc<OnceLock<Arc<dyn KeypairExpirer>>>) {
    let mut liveness = LivenessMap::default();
    while let Some(outcome) = rx.recv().await {
        let Some(engine) = engine.get() else {
            continue;
        };
        if !liveness.observe(&outcome.dst, outcome.ok) {
            continue;
        }

        warn!(endpoint = %outcome.dst, "link lost, forcing rehandshake");
        let expired = peer_key(&outcome.dst).and_then(|key| engine.expire_current_keypairs(&key));
        if let Err(e) = expired {
            warn!(endpoint = %outcome.dst, error = %e, "could not expire keypairs");
        }
    }
    debug!("adaptive bind watcher stopped");
}

/// Public key carried in an endpoint's fragment
pub fn peer_key(dst: &str) -> Result<[u8; KEY_LEN]> {
    let url = Url::parse(dst)?;
    let fragment = url
        .fragment()
        .ok_or_else(|| Error::InvalidPublicKey(format!("endpoint {} has no key fragment", dst)))?;
    parse_hex_key(fragment)
}
