//! Node wiring - identity, endpoint, handshake, events

use crate::config::Config;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use weft_core::{Identity, NetworkId, PeerAddress};
use weft_net::handshake::{HandshakeConfig, HandshakeService, RetrySchedule};
use weft_net::mux::{LoopbackRegistry, Multiplexer, MuxConfig};
use weft_net::registry::ConnectionRegistry;
use weft_net::{MuxError, NodeEvent};

/// Node errors
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("identity error: {0}")]
    Identity(#[from] weft_core::Error),
    #[error("endpoint error: {0}")]
    Mux(#[from] MuxError),
}

/// One weft node: identity, endpoint, and session management
pub struct Node {
    config: Config,
    identity: Identity,
    registry: Arc<ConnectionRegistry>,
    mux: Multiplexer,
    handshake: Arc<HandshakeService>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<NodeEvent>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Node {
    /// Load or mint the identity and wire up the node
    pub fn new(config: Config) -> Result<Self, NodeError> {
        let identity = Identity::load_or_generate(&config.identity_file, config.pow_difficulty)?;
        info!("node identity is {}", identity.address());

        let (events, events_rx) = weft_net::event::event_channel();
        let registry = Arc::new(ConnectionRegistry::new(events.clone()));
        // all nodes in this process share one loopback map, so co-hosted
        // peers reach each other without touching the socket
        let loopback = LoopbackRegistry::process_default();

        let mut mux_config = MuxConfig::new(NetworkId(config.network_id));
        mux_config.channel_high_watermark = config.channel_high_watermark;
        mux_config.channel_low_watermark = config.channel_low_watermark;
        let mux = Multiplexer::new(
            identity.clone(),
            mux_config,
            registry.clone(),
            loopback,
            events.clone(),
        );

        let mut handshake_config = HandshakeConfig::new(NetworkId(config.network_id));
        handshake_config.min_pow_difficulty = config.pow_difficulty;
        handshake_config.is_super_peer = config.accept_children;
        handshake_config.timeout = Duration::from_millis(config.handshake_timeout_ms);
        handshake_config.retry = RetrySchedule::from_millis(&config.retry_delays_ms);
        handshake_config.advertised_endpoints = config.advertise.clone();
        let handshake = Arc::new(HandshakeService::new(
            &identity,
            handshake_config,
            registry.clone(),
            events,
            Arc::new(mux.clone()),
        ));

        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            config,
            identity,
            registry,
            mux,
            handshake,
            events_rx: Mutex::new(Some(events_rx)),
            shutdown_tx,
        })
    }

    pub fn address(&self) -> PeerAddress {
        self.identity.address()
    }

    /// Bound UDP address, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.mux.local_addr()
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn mux(&self) -> &Multiplexer {
        &self.mux
    }

    /// Bind the endpoint and start the service tasks
    pub async fn start(&self) -> Result<(), NodeError> {
        self.mux.bind(self.config.listen).await?;
        info!(
            "listening on {} (network {})",
            self.mux.local_addr().map(|a| a.to_string()).unwrap_or_default(),
            self.config.network_id
        );

        // route inbound handshake traffic to the service
        if let Some(mut handshake_rx) = self.mux.take_handshake_rx() {
            let handshake = self.handshake.clone();
            tokio::spawn(async move {
                while let Some((from, message)) = handshake_rx.recv().await {
                    handshake.handle_message(from, message);
                }
            });
        }

        // surface node events in the log
        if let Some(mut events_rx) = self.events_rx.lock().take() {
            tokio::spawn(async move {
                while let Some(event) = events_rx.recv().await {
                    match event {
                        NodeEvent::NodeUp { address } => info!("node {} up", address),
                        NodeEvent::NodeDown { address } => info!("node {} down", address),
                        NodeEvent::PeerOnline { peer } => info!("peer {} online", peer),
                        NodeEvent::PeerUnreachable { peer } => {
                            warn!("peer {} unreachable", peer)
                        }
                        NodeEvent::MessageDropped { peer } => {
                            debug!("dropped inbound message from {}", peer)
                        }
                    }
                }
            });
        }

        for spec in &self.config.super_peer {
            let handshake = self.handshake.clone();
            let spec = spec.clone();
            tokio::spawn(async move {
                let gate = handshake.clone();
                match handshake
                    .connect(Some(spec.address), vec![spec.endpoint], true, move || {
                        gate.is_open()
                    })
                    .await
                {
                    Ok(info) => info!("joined super peer {} at {}", info.peer, info.endpoint),
                    Err(e) => warn!("could not join super peer {}: {}", spec.address, e),
                }
            });
        }
        Ok(())
    }

    /// Block until shutdown is requested
    pub async fn wait(&self) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let _ = shutdown_rx.recv().await;
    }

    /// Start and serve until shutdown
    pub async fn run(&self) -> Result<(), NodeError> {
        self.start().await?;
        self.wait().await;
        self.stop();
        Ok(())
    }

    /// Request shutdown from any task
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Tear down sessions and release the endpoint
    pub fn stop(&self) {
        info!("node {} shutting down", self.address());
        self.handshake.close();
        self.mux.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SuperPeerSpec;
    use clap::Parser;
    use weft_net::mux::MuxState;

    fn test_config(dir: &std::path::Path, name: &str) -> Config {
        let mut config = Config::parse_from(["weftd"]);
        config.listen = "127.0.0.1:0".parse().unwrap();
        config.identity_file = dir.join(name);
        config.pow_difficulty = 8;
        config.retry_delays_ms = vec![50];
        config
    }

    #[tokio::test]
    async fn test_node_starts_and_stops() {
        let dir = tempfile::tempdir().unwrap();
        let node = Node::new(test_config(dir.path(), "a.identity")).unwrap();

        node.start().await.unwrap();
        assert!(node.local_addr().is_some());
        assert_eq!(node.mux().state(), MuxState::Active);

        node.stop();
        assert_eq!(node.mux().state(), MuxState::Closed);
    }

    #[tokio::test]
    async fn test_identity_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let first = Node::new(test_config(dir.path(), "a.identity")).unwrap();
        let address = first.address();
        drop(first);

        let second = Node::new(test_config(dir.path(), "a.identity")).unwrap();
        assert_eq!(second.address(), address);
    }

    #[tokio::test]
    async fn test_nodes_share_process_loopback() {
        let dir = tempfile::tempdir().unwrap();
        let a = Node::new(test_config(dir.path(), "a.identity")).unwrap();
        let b = Node::new(test_config(dir.path(), "b.identity")).unwrap();
        a.start().await.unwrap();
        b.start().await.unwrap();

        // no session, no super peer: delivery only works via the shared
        // in-process loopback map
        let channel = a.mux().open_channel(b.address()).unwrap();
        channel.write(bytes::Bytes::from_static(b"ping")).await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        let received = loop {
            if let Some(inbound) = b.mux().channel(&a.address()) {
                if let Ok(Some(payload)) =
                    tokio::time::timeout(Duration::from_millis(100), inbound.recv()).await
                {
                    break payload;
                }
            }
            assert!(tokio::time::Instant::now() < deadline, "loopback delivery never arrived");
            tokio::time::sleep(Duration::from_millis(20)).await;
        };
        assert_eq!(&received[..], b"ping");

        a.stop();
        b.stop();
    }

    #[tokio::test]
    async fn test_child_joins_super_peer() {
        let dir = tempfile::tempdir().unwrap();

        let mut super_config = test_config(dir.path(), "super.identity");
        super_config.accept_children = true;
        let super_node = Node::new(super_config).unwrap();
        super_node.start().await.unwrap();

        let mut child_config = test_config(dir.path(), "child.identity");
        child_config.super_peer = vec![SuperPeerSpec {
            address: super_node.address(),
            endpoint: super_node.local_addr().unwrap(),
        }];
        let child = Node::new(child_config).unwrap();
        child.start().await.unwrap();

        // the join runs in the background; poll until the path lands
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if child.registry().best_path(&super_node.address()).is_some() {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "join never completed");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(child.registry().super_peer(), Some(super_node.address()));

        // the reverse path exists on the super peer as well
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if super_node.registry().best_path(&child.address()).is_some() {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "confirm never arrived");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        child.stop();
        super_node.stop();
    }
}
