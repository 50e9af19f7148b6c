//! Peer references
//!
//! A peer is configured as a single link in one of three forms:
//!
//! - `peer://<pubkey>[/<preshared>][?keepalive=N]`: key given inline, no lookup
//! - `peer://<domain>[/<preshared>][?keepalive=N]`: relay link found in a DNS URI record
//! - `http[s]://host/path?peer=<pubkey>[&preshared=<key>][&keepalive=N]`
//!
//! Resolution turns a reference into the record handed to the tunnel engine.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};
use url::Url;

use crate::address::{self, Prefix};
use crate::crypto::{parse_key, KEY_LEN};
use crate::dns::{self, DohTransport};
use crate::error::{Error, Result};

pub const PEER_SCHEME: &str = "peer";
pub const PEER_PARAM: &str = "peer";
pub const PRESHARED_PARAM: &str = "preshared";
pub const KEEPALIVE_PARAM: &str = "keepalive";

/// Deadline shared by a batch of resolutions
pub const DEFAULT_RESOLVE_TIMEOUT: Duration = Duration::from_secs(60);

/// A peer ready to be configured on the tunnel engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPeer {
    pub public_key: [u8; KEY_LEN],
    /// Overlay address of the peer as a host prefix
    pub allowed_ip: Prefix,
    pub preshared_key: Option<[u8; KEY_LEN]>,
    /// Relay link, its fragment set to the hex public key
    pub endpoint: Option<String>,
    pub keepalive: Option<String>,
}

impl ResolvedPeer {
    pub fn public_hex(&self) -> String {
        hex::encode(self.public_key)
    }

    pub fn preshared_hex(&self) -> Option<String> {
        self.preshared_key.map(hex::encode)
    }
}

/// Resolves peer references, looking up DNS over HTTPS when needed
#[derive(Clone)]
pub struct PeerResolver {
    doh: Arc<dyn DohTransport>,
}

impl PeerResolver {
    pub fn new(doh: Arc<dyn DohTransport>) -> Self {
        Self { doh }
    }

    /// Resolve one reference
    pub async fn parse_peer(&self, reference: &str) -> Result<ResolvedPeer> {
        let link = Url::parse(reference)?;
        let keepalive = query_param(&link, KEEPALIVE_PARAM);

        let scheme = link.scheme().to_string();
        let (public_key, endpoint, preshared) = match scheme.as_str() {
            PEER_SCHEME => {
                let host = link
                    .host_str()
                    .filter(|h| !h.is_empty())
                    .ok_or_else(|| Error::Parse(format!("peer reference without host: {}", reference)))?;
                let preshared = link.path().trim_start_matches('/');
                let preshared = (!preshared.is_empty()).then(|| preshared.to_string());

                if host.contains('.') {
                    let (key, endpoint) = self.discover(host).await?;
                    (key, Some(endpoint), preshared)
                } else {
                    (parse_key(host)?, None, preshared)
                }
            }
            "http" | "https" => {
                let key = query_param(&link, PEER_PARAM)
                    .ok_or_else(|| Error::InvalidPublicKey(format!("no {} parameter in {}", PEER_PARAM, reference)))?;
                let preshared = query_param(&link, PRESHARED_PARAM);
                (parse_key(&key)?, Some(reference.to_string()), preshared)
            }
            other => return Err(Error::UnsupportedScheme(other.to_string())),
        };

        let preshared_key = preshared
            .map(|encoded| {
                parse_key(&encoded).map_err(|_| Error::Parse(format!("invalid preshared key in {}", reference)))
            })
            .transpose()?;

        let allowed_ip = address::derive_prefix(&public_key)?;
        let endpoint = endpoint.map(|link| with_key_fragment(&link, &public_key));

        Ok(ResolvedPeer {
            public_key,
            allowed_ip,
            preshared_key,
            endpoint,
            keepalive,
        })
    }

    /// Find the relay link and key published for `domain`
    async fn discover(&self, domain: &str) -> Result<([u8; KEY_LEN], String)> {
        let target = dns::lookup_uri(&*self.doh, domain)
            .await?
            .ok_or_else(|| Error::Protocol(format!("no URI record for {}", domain)))?;
        let endpoint = Url::parse(&target)?;

        let key = match query_param(&endpoint, PEER_PARAM) {
            Some(encoded) => parse_key(&encoded)?,
            None => dns::lookup_cname_pubkey(&*self.doh, domain).await?,
        };
        Ok((key, target))
    }

    /// Resolve every reference concurrently under one deadline
    ///
    /// All or nothing: the first failure aborts the batch.
    pub async fn resolve_all(&self, references: &[String], deadline: Duration) -> Result<Vec<ResolvedPeer>> {
        debug!(count = references.len(), "peers resolving");
        let batch = futures::future::try_join_all(references.iter().map(|r| self.parse_peer(r)));

        let peers = match tokio::time::timeout(deadline, batch).await {
            Ok(peers) => peers?,
            Err(_) => return Err(Error::ResolutionTimeout(deadline)),
        };

        for peer in &peers {
            debug!(peer = %peer.public_hex(), ip = %peer.allowed_ip, endpoint = ?peer.endpoint, "peer resolved");
        }
        info!("Resolved {} peers", peers.len());
        Ok(peers)
    }
}

/// Replace the fragment of `link` with the hex key, keeping the rest verbatim
fn with_key_fragment(link: &str, public_key: &[u8; KEY_LEN]) -> String {
    let base = link.split_once('#').map_or(link, |(base, _)| base);
    format!("{}#{}", base, hex::encode(public_key))
}

fn query_param(url: &Url, name: &str) -> Option<String> {
    url.query_pairs()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.into_owned())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::testing::{StaticDoh, UnreachableDoh};

    const KEY_HEX: &str = "2d3c1fc70a296501c202a7f48e64badc8822d5eb3e234bae9b75164f9b82441f";
    const PSK_HEX: &str = "0101010101010101010101010101010101010101010101010101010101010101";

    fn offline() -> PeerResolver {
        PeerResolver::new(Arc::new(UnreachableDoh))
    }

    fn key() -> [u8; KEY_LEN] {
        crate::crypto::parse_hex_key(KEY_HEX).unwrap()
    }

    struct SlowDoh;

    #[async_trait::async_trait]
    impl DohTransport for SlowDoh {
        async fn exchange(&self, _query: Vec<u8>) -> Result<Vec<u8>> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Err(Error::Internal("unreachable".into()))
        }
    }

    #[tokio::test]
    async fn test_inline_key_needs_no_network() {
        let peer = offline().parse_peer(&format!("peer://{}", KEY_HEX)).await.unwrap();
        assert_eq!(peer.public_hex(), KEY_HEX);
        assert_eq!(peer.allowed_ip, address::derive_prefix(&key()).unwrap());
        assert_eq!(peer.allowed_ip.len, 128);
        assert!(peer.endpoint.is_none());
        assert!(peer.preshared_key.is_none());
        assert!(peer.keepalive.is_none());
    }

    #[tokio::test]
    async fn test_inline_key_with_preshared_and_keepalive() {
        let reference = format!("peer://{}/{}?keepalive=25", KEY_HEX, PSK_HEX);
        let peer = offline().parse_peer(&reference).await.unwrap();
        assert_eq!(peer.preshared_hex().as_deref(), Some(PSK_HEX));
        assert_eq!(peer.keepalive.as_deref(), Some("25"));
    }

    #[tokio::test]
    async fn test_http_reference() {
        let reference = format!(
            "http://relay.example.net/inbox?peer={}&preshared={}&keepalive=15",
            KEY_HEX, PSK_HEX
        );
        let peer = offline().parse_peer(&reference).await.unwrap();

        assert_eq!(peer.endpoint, Some(format!("{}#{}", reference, KEY_HEX)));
        assert_eq!(peer.preshared_hex().as_deref(), Some(PSK_HEX));
        assert_eq!(peer.keepalive.as_deref(), Some("15"));
        assert_eq!(peer.public_key, key());
    }

    #[tokio::test]
    async fn test_http_reference_text_is_kept() {
        let reference = format!("http://h?peer={}&preshared={}&keepalive=15", KEY_HEX, PSK_HEX);
        let peer = offline().parse_peer(&reference).await.unwrap();
        assert_eq!(peer.endpoint, Some(format!("{}#{}", reference, KEY_HEX)));
    }

    #[tokio::test]
    async fn test_http_fragment_is_replaced() {
        let reference = format!("https://relay.example.net/inbox?peer={}#stale", KEY_HEX);
        let peer = offline().parse_peer(&reference).await.unwrap();
        assert_eq!(
            peer.endpoint,
            Some(format!("https://relay.example.net/inbox?peer={}#{}", KEY_HEX, KEY_HEX))
        );
    }

    #[tokio::test]
    async fn test_http_without_peer_param() {
        let err = offline().parse_peer("https://relay.example.net/inbox").await.unwrap_err();
        assert!(matches!(err, Error::InvalidPublicKey(_)));
    }

    #[tokio::test]
    async fn test_rejects_bad_input() {
        let resolver = offline();
        assert!(matches!(
            resolver.parse_peer(&format!("ftp://{}", KEY_HEX)).await,
            Err(Error::UnsupportedScheme(s)) if s == "ftp"
        ));
        assert!(matches!(resolver.parse_peer("peer://abcd").await, Err(Error::InvalidPublicKey(_))));
        assert!(matches!(
            resolver.parse_peer(&format!("peer://{}/short", KEY_HEX)).await,
            Err(Error::Parse(_))
        ));
        assert!(matches!(resolver.parse_peer("not a link").await, Err(Error::Url(_))));
    }

    #[tokio::test]
    async fn test_domain_reference_uses_uri_record() {
        let doh = StaticDoh::uri(&format!("https://relay.example.net/inbox?peer={}", KEY_HEX));
        let resolver = PeerResolver::new(Arc::new(doh));

        let peer = resolver.parse_peer("peer://node.example.net?keepalive=10").await.unwrap();
        assert_eq!(peer.public_key, key());
        assert_eq!(
            peer.endpoint.as_deref(),
            Some(format!("https://relay.example.net/inbox?peer={}#{}", KEY_HEX, KEY_HEX).as_str())
        );
        assert_eq!(peer.keepalive.as_deref(), Some("10"));
    }

    #[tokio::test]
    async fn test_domain_reference_falls_back_to_cname() {
        let cname = format!("{}.{}.keys.example.net", &KEY_HEX[..1], &KEY_HEX[1..]);
        let doh = StaticDoh::uri("https://relay.example.net/inbox").with(StaticDoh::cname(&cname));
        let resolver = PeerResolver::new(Arc::new(doh));

        let peer = resolver.parse_peer("peer://node.example.net").await.unwrap();
        assert_eq!(peer.public_key, key());
        assert_eq!(
            peer.endpoint.as_deref(),
            Some(format!("https://relay.example.net/inbox#{}", KEY_HEX).as_str())
        );
    }

    #[tokio::test]
    async fn test_domain_without_uri_record() {
        let resolver = PeerResolver::new(Arc::new(StaticDoh::default()));
        let err = resolver.parse_peer("peer://node.example.net").await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[tokio::test]
    async fn test_resolve_all_keeps_order() {
        let other = crate::crypto::KeyPair::generate().public_hex();
        let refs = vec![format!("peer://{}", KEY_HEX), format!("peer://{}", other)];
        let peers = offline().resolve_all(&refs, Duration::from_secs(5)).await.unwrap();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].public_hex(), KEY_HEX);
        assert_eq!(peers[1].public_hex(), other);
    }

    #[tokio::test]
    async fn test_resolve_all_is_fail_fast() {
        let refs = vec![format!("peer://{}", KEY_HEX), "gopher://x".to_string()];
        let err = offline().resolve_all(&refs, Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, Error::UnsupportedScheme(_)));
    }

    #[tokio::test]
    async fn test_resolve_all_deadline() {
        let resolver = PeerResolver::new(Arc::new(SlowDoh));
        let refs = vec!["peer://slow.example.net".to_string()];
        let err = resolver.resolve_all(&refs, Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, Error::ResolutionTimeout(_)));
    }
}
