//! Rendezvous Client
//!
//! HTTP client for relay servers. Offers go out as signed POSTs; inbound
//! offers are read from one event stream per relay and funnelled into a
//! single bounded queue.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use reqwest::header::{ACCEPT, CACHE_CONTROL, CONTENT_TYPE};
use reqwest::StatusCode;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinSet;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::codec::FramedRead;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::reconnect::{ReconnectPolicy, DEFAULT_RECONNECT_INTERVAL};
use super::sign::sign_url;
use super::sse::{Event, EventCodec};
use super::{Channel, Session, SessionDescription, EVENT_ID_HEADER, INBOUND_QUEUE_CAPACITY};
use crate::crypto::KeyPair;
use crate::error::{Error, Result};

/// Default deadline for handshake and resolve requests
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration for the rendezvous client
#[derive(Debug, Clone)]
pub struct SignalingConfig {
    /// Deadline for a single POST or DELETE
    pub request_timeout: Duration,
    /// Pause between subscription attempts
    pub reconnect_interval: Duration,
    /// Inbound queue capacity shared by all relays
    pub queue_capacity: usize,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            queue_capacity: INBOUND_QUEUE_CAPACITY,
        }
    }
}

/// State shared with subscriptions and sessions
struct Shared {
    key: KeyPair,
    http: reqwest::Client,
    config: SignalingConfig,
    scope: CancellationToken,
}

/// Signaling client talking to relay servers
///
/// Dropping the client aborts its subscriptions; [`RendezvousClient::close`]
/// stops them and waits for them to finish.
pub struct RendezvousClient {
    shared: Arc<Shared>,
    servers: Vec<String>,
    tasks: Mutex<JoinSet<Result<()>>>,
}

impl RendezvousClient {
    /// Create a client listening on `servers`
    pub fn new(key: KeyPair, servers: Vec<String>, config: SignalingConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.request_timeout)
            .build()?;
        Ok(Self::with_http_client(key, servers, config, http))
    }

    /// Create a client with a preconfigured HTTP client
    pub fn with_http_client(
        key: KeyPair,
        servers: Vec<String>,
        config: SignalingConfig,
        http: reqwest::Client,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                key,
                http,
                config,
                scope: CancellationToken::new(),
            }),
            servers,
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    /// Relay links this client subscribes to
    pub fn servers(&self) -> &[String] {
        &self.servers
    }

    /// This node's public key as hex
    pub fn public_hex(&self) -> String {
        self.shared.key.public_hex()
    }

    /// Send `offer` to the peer behind `endpoint` and return its answer
    pub async fn handshake(&self, endpoint: &str, offer: &SessionDescription) -> Result<SessionDescription> {
        debug!(endpoint, "handshake pending");
        let result = self.handshake_inner(endpoint, offer).await;
        match &result {
            Ok(_) => debug!(endpoint, "handshake successful"),
            Err(e) => warn!(endpoint, error = %e, "handshake failed"),
        }
        result
    }

    async fn handshake_inner(&self, endpoint: &str, offer: &SessionDescription) -> Result<SessionDescription> {
        let body = serde_json::to_vec(offer)?;
        let link = sign_url(endpoint, &self.shared.key)?;

        let resp = self
            .shared
            .http
            .post(link)
            .header(CONTENT_TYPE, "application/json")
            .timeout(self.shared.config.request_timeout)
            .body(body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Handshake {
                status: status.as_u16(),
                url: endpoint.to_string(),
            });
        }

        let bytes = resp.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| {
            debug!(endpoint, error = %e, "undecodable answer");
            Error::Handshake {
                status: status.as_u16(),
                url: endpoint.to_string(),
            }
        })
    }

    /// Subscribe to every relay and return the stream of inbound offers
    ///
    /// Resolves once each relay accepted its first subscription. A relay that
    /// rejects the first attempt with anything but 423 fails the call and
    /// closes the client. Later failures are retried until [`close`].
    ///
    /// [`close`]: RendezvousClient::close
    pub async fn accept(&self) -> Result<ReceiverStream<RelaySession>> {
        let (tx, rx) = mpsc::channel(self.shared.config.queue_capacity);
        if self.servers.is_empty() {
            return Ok(ReceiverStream::new(rx));
        }
        if self.shared.scope.is_cancelled() {
            return Err(Error::Closed);
        }

        let mut ready = Vec::with_capacity(self.servers.len());
        {
            let mut tasks = self.tasks.lock().await;
            for server in &self.servers {
                let (ready_tx, ready_rx) = oneshot::channel();
                ready.push(async move { ready_rx.await.unwrap_or(Err(Error::Closed)) });

                let subscription = Subscription {
                    shared: Arc::clone(&self.shared),
                    server: server.clone(),
                    tx: tx.clone(),
                };
                tasks.spawn(subscription.run(ready_tx));
            }
        }
        drop(tx);

        if let Err(e) = futures::future::try_join_all(ready).await {
            self.shared.scope.cancel();
            return Err(e);
        }
        info!(relays = self.servers.len(), "Listening for offers");
        Ok(ReceiverStream::new(rx))
    }

    /// Cancel all subscriptions and wait for them to finish
    ///
    /// Ends the stream returned by [`RendezvousClient::accept`]. Calling it
    /// again is a no-op.
    pub async fn close(&self) {
        self.shared.scope.cancel();

        let mut tasks = self.tasks.lock().await;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "subscription ended with error"),
                Err(e) if e.is_cancelled() => {}
                Err(e) => error!(error = %e, "subscription task panicked"),
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.scope.is_cancelled()
    }
}

#[async_trait::async_trait]
impl Channel for RendezvousClient {
    type Session = RelaySession;

    async fn handshake(&self, endpoint: &str, offer: &SessionDescription) -> Result<SessionDescription> {
        RendezvousClient::handshake(self, endpoint, offer).await
    }

    async fn accept(&self) -> Result<ReceiverStream<RelaySession>> {
        RendezvousClient::accept(self).await
    }

    async fn close(&self) {
        RendezvousClient::close(self).await
    }
}

/// One durable event stream subscription
struct Subscription {
    shared: Arc<Shared>,
    server: String,
    tx: mpsc::Sender<RelaySession>,
}

impl Subscription {
    async fn run(self, ready: oneshot::Sender<Result<()>>) -> Result<()> {
        let server = self.server.as_str();
        let mut ready = Some(ready);
        let policy = ReconnectPolicy::new(self.shared.scope.clone(), self.shared.config.reconnect_interval);
        debug!(server, "subscribe start");

        loop {
            // Every attempt needs a fresh signature
            let link = match sign_url(server, &self.shared.key) {
                Ok(link) => link,
                Err(e) => return report(&mut ready, e),
            };

            let request = self
                .shared
                .http
                .get(link)
                .header(ACCEPT, "text/event-stream")
                .header(CACHE_CONTROL, "no-cache")
                .send();
            let outcome = tokio::select! {
                _ = self.shared.scope.cancelled() => break,
                outcome = request => outcome,
            };

            match outcome {
                Ok(resp) if resp.status() == StatusCode::OK => {
                    if let Some(ready) = ready.take() {
                        debug!(server, "subscribed");
                        let _ = ready.send(Ok(()));
                    }
                    if !self.pump(resp).await {
                        break;
                    }
                }
                Ok(resp) if resp.status() == StatusCode::LOCKED => {
                    warn!(server, "relay is locked, retrying");
                }
                Ok(resp) => {
                    let status = resp.status();
                    if ready.is_some() {
                        let e = Error::Protocol(format!("could not connect to stream {}: {}", server, status));
                        warn!(server, error = %e, "subscribe failed");
                        return report(&mut ready, e);
                    }
                    debug!(server, %status, "resubscribe rejected, retrying");
                }
                Err(e) => {
                    debug!(server, error = %e, "relay unreachable, retrying");
                }
            }

            if !policy.wait().await {
                break;
            }
        }

        debug!(server, "subscription stopped");
        Ok(())
    }

    /// Read events until the stream ends; false once the subscription should stop
    async fn pump(&self, resp: reqwest::Response) -> bool {
        let body = Box::pin(
            resp.bytes_stream()
                .map(|chunk| chunk.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))),
        );
        let mut events = FramedRead::new(StreamReader::new(body), EventCodec::new());

        loop {
            let next = tokio::select! {
                _ = self.shared.scope.cancelled() => return false,
                next = events.next() => next,
            };
            match next {
                Some(Ok(event)) => {
                    if !self.deliver(event).await {
                        return false;
                    }
                }
                Some(Err(e)) => {
                    debug!(server = %self.server, error = %e, "event stream broken");
                    return true;
                }
                None => {
                    debug!(server = %self.server, "event stream ended");
                    return true;
                }
            }
        }
    }

    /// Queue an inbound offer; false once nobody is listening any more
    async fn deliver(&self, event: Event) -> bool {
        if event.data.is_empty() {
            return true;
        }
        debug!(server = %self.server, event_id = %event.id, "offer received");

        let sdp = match serde_json::from_str::<SessionDescription>(&event.data) {
            Ok(sdp) => sdp,
            Err(e) => {
                warn!(server = %self.server, event_id = %event.id, error = %e, data = %event.data, "dropping malformed offer");
                return true;
            }
        };

        let session = RelaySession {
            shared: Arc::clone(&self.shared),
            link: self.server.clone(),
            id: event.id,
            sdp,
        };
        tokio::select! {
            _ = self.shared.scope.cancelled() => false,
            sent = self.tx.send(session) => sent.is_ok(),
        }
    }
}

/// Hand a first-attempt error to `accept`, or to `close` if `accept` already returned
fn report(ready: &mut Option<oneshot::Sender<Result<()>>>, e: Error) -> Result<()> {
    match ready.take() {
        Some(ready) => {
            let _ = ready.send(Err(e));
            Ok(())
        }
        None => Err(e),
    }
}

/// An offer received from a relay
pub struct RelaySession {
    shared: Arc<Shared>,
    link: String,
    id: String,
    sdp: SessionDescription,
}

impl std::fmt::Debug for RelaySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelaySession")
            .field("link", &self.link)
            .field("id", &self.id)
            .field("sdp", &self.sdp)
            .finish()
    }
}

impl RelaySession {
    /// Relay link the offer arrived on
    pub fn source_server(&self) -> &str {
        &self.link
    }

    async fn resolve_inner(&self, answer: &SessionDescription) -> Result<()> {
        let body = serde_json::to_vec(answer)?;
        let link = sign_url(&self.link, &self.shared.key)?;

        let request = self
            .shared
            .http
            .delete(link)
            .header(EVENT_ID_HEADER, &self.id)
            .header(CONTENT_TYPE, "application/json")
            .timeout(self.shared.config.request_timeout)
            .body(body)
            .send();
        let resp = tokio::select! {
            _ = self.shared.scope.cancelled() => return Err(Error::Closed),
            resp = request => resp?,
        };

        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Resolve {
                status: status.as_u16(),
                url: self.link.clone(),
            });
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Session for RelaySession {
    fn id(&self) -> &str {
        &self.id
    }

    fn description(&self) -> &SessionDescription {
        &self.sdp
    }

    async fn resolve(&self, answer: &SessionDescription) -> Result<()> {
        debug!(event_id = %self.id, server = %self.link, "accept handshake pending");
        let result = self.resolve_inner(answer).await;
        match &result {
            Ok(()) => debug!(event_id = %self.id, "accept handshake successful"),
            Err(e) => warn!(event_id = %self.id, error = %e, "accept handshake failed"),
        }
        result
    }

    /// Relays expire unanswered offers on their own
    fn reject(&self, reason: &Error) {
        debug!(event_id = %self.id, reason = %reason, "offer rejected");
    }
}
