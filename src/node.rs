//! Node bring-up
//!
//! Wires the signaling client, the adaptive bind and the tunnel engine
//! together, configures the device and peers and brings the overlay
//! interface up. The engine, the datagram transport and the interface are
//! supplied by a [`Platform`].

use std::net::Ipv6Addr;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::address::{self, Prefix, OVERLAY_NETWORK};
use crate::bind::{AdaptiveBind, Bind, KeypairExpirer};
use crate::config::{SigmeshConfig, TunMode};
use crate::crypto::KeyPair;
use crate::device::{render_peers, DeviceConfig};
use crate::dns::{DohTransport, HttpsDoh};
use crate::error::{Error, Result};
use crate::peer::{PeerResolver, ResolvedPeer};
use crate::signaling::RendezvousClient;

/// Cryptographic tunnel engine
pub trait TunnelEngine: KeypairExpirer {
    /// Apply `key=value` configuration lines
    fn ipc_set(&self, config: &str) -> Result<()>;

    /// Start processing packets
    fn up(&self) -> Result<()>;

    /// Stop the engine
    fn close(&self) {}
}

/// OS or userspace network interface
pub trait InterfaceConfigurator: Send + Sync {
    fn set_mtu(&self, mtu: u32) -> Result<()>;

    fn add_route(&self, prefix: Prefix) -> Result<()>;

    fn up(&self) -> Result<()>;
}

/// Provides the collaborators a node runs on
pub trait Platform {
    type Bind: Bind + 'static;
    type Engine: TunnelEngine + 'static;

    /// Datagram transport carried over sessions negotiated by `channel`
    fn bind(&self, channel: Arc<RendezvousClient>) -> Result<Self::Bind>;

    /// Tunnel engine sending through `bind`
    fn engine(&self, bind: Arc<AdaptiveBind<Self::Bind>>) -> Result<Arc<Self::Engine>>;

    /// Interface configurator for the requested device mode
    fn interface(&self, mode: TunMode) -> Result<Arc<dyn InterfaceConfigurator>>;

    /// Resolver for `peer://<domain>` references
    fn doh(&self, config: &SigmeshConfig) -> Result<Arc<dyn DohTransport>> {
        Ok(Arc::new(HttpsDoh::new(&config.signaling.doh, config.request_timeout())?))
    }
}

/// A running node
pub struct Node<P: Platform> {
    client: Arc<RendezvousClient>,
    bind: Arc<AdaptiveBind<P::Bind>>,
    engine: Arc<P::Engine>,
    address: Ipv6Addr,
    peers: Vec<ResolvedPeer>,
}

impl<P: Platform> Node<P> {
    /// Bring the node up; any failure aborts start-up
    pub async fn start(config: &SigmeshConfig, platform: &P) -> Result<Self> {
        let key = config.keypair()?;
        let client = Arc::new(RendezvousClient::new(
            key.clone(),
            config.signaling.links.clone(),
            config.signaling_config(),
        )?);

        match Self::bring_up(config, platform, &key, Arc::clone(&client)).await {
            Ok(node) => Ok(node),
            Err(e) => {
                client.close().await;
                Err(e)
            }
        }
    }

    async fn bring_up(
        config: &SigmeshConfig,
        platform: &P,
        key: &KeyPair,
        client: Arc<RendezvousClient>,
    ) -> Result<Self> {
        let bind = Arc::new(AdaptiveBind::new(platform.bind(Arc::clone(&client))?));
        let engine = platform.engine(Arc::clone(&bind))?;
        bind.attach(engine.clone())?;

        debug!("device configuration pending");
        let device = DeviceConfig {
            private_key: key.private_hex(),
            listen_port: config.node.listen_port,
        };
        engine.ipc_set(&device.to_string())?;
        debug!("device configuration complete");

        let resolver = PeerResolver::new(platform.doh(config)?);
        let peers = resolver
            .resolve_all(&config.peers, config.resolve_timeout())
            .await?;
        engine.ipc_set(&render_peers(&peers))?;
        debug!(count = peers.len(), "peer configuration applied");

        engine.up()?;
        info!("Tunnel engine started");

        // Own address, overlay-wide prefix length
        let route = address::derive_prefix(&key.public_bytes())?.with_len(OVERLAY_NETWORK.len)?;
        let address = route.addr;
        let iface = platform.interface(config.node.mode)?;
        iface.set_mtu(config.node.mtu)?;
        iface.add_route(route)?;
        iface.up()?;
        info!(
            "Interface {} up at {} ({} mode, mtu {})",
            config.node.tun, address, config.node.mode, config.node.mtu
        );

        Ok(Self {
            client,
            bind,
            engine,
            address,
            peers,
        })
    }

    /// Overlay address of this node
    pub fn address(&self) -> Ipv6Addr {
        self.address
    }

    pub fn peers(&self) -> &[ResolvedPeer] {
        &self.peers
    }

    pub fn client(&self) -> &Arc<RendezvousClient> {
        &self.client
    }

    pub fn bind(&self) -> &Arc<AdaptiveBind<P::Bind>> {
        &self.bind
    }

    /// Stop signaling and the engine
    pub async fn close(&self) {
        self.client.close().await;
        self.engine.close();
        info!("Node stopped");
    }
}

/// Reject a configurator that cannot serve `mode`
pub fn require_mode(requested: TunMode, supported: &[TunMode]) -> Result<()> {
    if supported.contains(&requested) {
        return Ok(());
    }
    warn!(mode = %requested, "device mode not supported on this platform");
    Err(Error::Config(format!("{} device mode is not supported", requested)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bind::Endpoint;
    use crate::crypto::KEY_LEN;
    use crate::dns::testing::UnreachableDoh;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    struct NullBind;

    impl Bind for NullBind {
        fn send(&self, _bufs: &[&[u8]], _endpoint: &Endpoint) -> Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingEngine {
        ipc: Mutex<Vec<String>>,
        up: AtomicBool,
        closed: AtomicBool,
    }

    impl KeypairExpirer for RecordingEngine {
        fn expire_current_keypairs(&self, _public_key: &[u8; KEY_LEN]) -> Result<()> {
            Ok(())
        }
    }

    impl TunnelEngine for RecordingEngine {
        fn ipc_set(&self, config: &str) -> Result<()> {
            self.ipc.lock().unwrap().push(config.to_string());
            Ok(())
        }

        fn up(&self) -> Result<()> {
            self.up.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct RecordingInterface {
        mtu: Mutex<Option<u32>>,
        routes: Mutex<Vec<Prefix>>,
        up: AtomicBool,
    }

    impl InterfaceConfigurator for RecordingInterface {
        fn set_mtu(&self, mtu: u32) -> Result<()> {
            *self.mtu.lock().unwrap() = Some(mtu);
            Ok(())
        }

        fn add_route(&self, prefix: Prefix) -> Result<()> {
            self.routes.lock().unwrap().push(prefix);
            Ok(())
        }

        fn up(&self) -> Result<()> {
            self.up.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct TestPlatform {
        engine: Arc<RecordingEngine>,
        iface: Arc<RecordingInterface>,
        modes: Mutex<Vec<TunMode>>,
    }

    impl Platform for TestPlatform {
        type Bind = NullBind;
        type Engine = RecordingEngine;

        fn bind(&self, _channel: Arc<RendezvousClient>) -> Result<NullBind> {
            Ok(NullBind)
        }

        fn engine(&self, _bind: Arc<AdaptiveBind<NullBind>>) -> Result<Arc<RecordingEngine>> {
            Ok(Arc::clone(&self.engine))
        }

        fn interface(&self, mode: TunMode) -> Result<Arc<dyn InterfaceConfigurator>> {
            self.modes.lock().unwrap().push(mode);
            require_mode(mode, &[TunMode::Kernel])?;
            Ok(self.iface.clone())
        }

        fn doh(&self, _config: &SigmeshConfig) -> Result<Arc<dyn DohTransport>> {
            Ok(Arc::new(UnreachableDoh))
        }
    }

    fn config_with_peers(peers: Vec<String>) -> (SigmeshConfig, KeyPair) {
        let key = KeyPair::generate();
        let mut config = SigmeshConfig::new(key.private_hex());
        config.node.listen_port = 51820;
        config.peers = peers;
        (config, key)
    }

    #[tokio::test]
    async fn test_start_configures_engine_and_interface() {
        let peer = KeyPair::generate().public_hex();
        let (config, key) = config_with_peers(vec![format!("peer://{}?keepalive=20", peer)]);
        let platform = TestPlatform::default();

        let node = Node::start(&config, &platform).await.unwrap();

        let ipc = platform.engine.ipc.lock().unwrap().clone();
        assert_eq!(ipc.len(), 2);
        assert_eq!(ipc[0], format!("private_key={}\nlisten_port=51820\n", key.private_hex()));
        assert!(ipc[1].starts_with(&format!("public_key={}\n", peer)));
        assert!(ipc[1].contains("persistent_keepalive_interval=20\n"));
        assert!(platform.engine.up.load(Ordering::SeqCst));

        let expected = address::derive(&key.public_bytes()).unwrap();
        assert_eq!(node.address(), expected);
        assert_eq!(node.peers().len(), 1);
        assert_eq!(*platform.iface.routes.lock().unwrap(), vec![Prefix::new(expected, 24).unwrap()]);
        assert_eq!(*platform.iface.mtu.lock().unwrap(), Some(2320));
        assert!(platform.iface.up.load(Ordering::SeqCst));
        assert_eq!(*platform.modes.lock().unwrap(), vec![TunMode::Kernel]);

        node.close().await;
        assert!(node.client().is_closed());
        assert!(platform.engine.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_bad_peer_aborts_start() {
        let (config, _) = config_with_peers(vec!["gopher://nope".to_string()]);
        let platform = TestPlatform::default();

        let err = Node::start(&config, &platform).await.err().unwrap();
        assert!(matches!(err, Error::UnsupportedScheme(_)));
        assert!(!platform.engine.up.load(Ordering::SeqCst));
        assert!(platform.iface.routes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mode_flag_selects_interface() {
        let (mut config, _) = config_with_peers(Vec::new());
        config.node.mode = TunMode::Userspace;
        let platform = TestPlatform::default();

        let err = Node::start(&config, &platform).await.err().unwrap();
        assert!(matches!(err, Error::Config(_)));
        assert_eq!(*platform.modes.lock().unwrap(), vec![TunMode::Userspace]);
    }

    #[tokio::test]
    async fn test_configured_mtu_reaches_interface() {
        let (mut config, _) = config_with_peers(Vec::new());
        config.node.mtu = 1280;
        let platform = TestPlatform::default();

        let node = Node::start(&config, &platform).await.unwrap();
        assert_eq!(*platform.iface.mtu.lock().unwrap(), Some(1280));
        node.close().await;
    }
}
