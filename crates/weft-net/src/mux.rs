//! Virtual channel multiplexer
//!
//! The single per-node endpoint bound to one identity. Inbound datagrams are
//! demultiplexed by sender address onto per-peer virtual channels (created
//! lazily on first contact); outbound writes from all channels funnel into
//! one writer draining onto the physical transport. Peers hosted by another
//! multiplexer in the same process are reached through the loopback
//! registry, bypassing the transport entirely.

use crate::channel::{ChannelError, ChannelParent, CloseReason, QueueOutcome, VirtualChannel};
use crate::event::{emit, EventSink, NodeEvent};
use crate::handshake;
use crate::registry::ConnectionRegistry;
use crate::transport::{TransportBinding, TransportError, UdpBinding, DEFAULT_RECV_BUFFER_MSGS};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, trace, warn};
use weft_core::{Identity, NetworkId, PeerAddress};

/// Multiplexer errors
#[derive(Debug, Error)]
pub enum MuxError {
    #[error("endpoint already bound")]
    AlreadyBound,
    #[error("endpoint not active")]
    NotActive,
    #[error("endpoint closed")]
    Closed,
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("message encoding failed: {0}")]
    Encode(String),
}

/// Endpoint lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MuxState {
    Open,
    Active,
    Closed,
}

/// Multiplexer tuning knobs
#[derive(Clone, Debug)]
pub struct MuxConfig {
    pub network_id: NetworkId,
    /// Datagrams drained per receive cycle before yielding
    pub read_budget: usize,
    /// Capacity of the outbound write queue
    pub outbound_queue: usize,
    /// Inbound queue size at which a channel refuses further messages
    pub channel_high_watermark: usize,
    /// Inbound queue size at which a refusing channel accepts again
    pub channel_low_watermark: usize,
}

impl MuxConfig {
    pub fn new(network_id: NetworkId) -> Self {
        Self {
            network_id,
            read_budget: DEFAULT_RECV_BUFFER_MSGS,
            outbound_queue: DEFAULT_RECV_BUFFER_MSGS,
            channel_high_watermark: 64,
            channel_low_watermark: 32,
        }
    }
}

/// Datagram envelope carried on the physical transport
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) enum Envelope {
    App(AppMessage),
    Handshake(handshake::Message),
}

/// Application payload addressed between two peers
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct AppMessage {
    pub network_id: NetworkId,
    pub sender: PeerAddress,
    pub recipient: PeerAddress,
    pub payload: Vec<u8>,
}

/// Process-wide map of live multiplexers, keyed by peer address
///
/// Entries are inserted on successful bind and removed on close. The
/// registry is passed explicitly into each multiplexer so tests can run
/// with isolated instances.
#[derive(Default)]
pub struct LoopbackRegistry {
    inner: RwLock<HashMap<PeerAddress, Weak<MuxShared>>>,
}

impl LoopbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared process-wide instance
    ///
    /// Nodes built with this handle discover each other in-process, so
    /// traffic between them never touches the socket.
    pub fn process_default() -> Arc<LoopbackRegistry> {
        static DEFAULT: OnceLock<Arc<LoopbackRegistry>> = OnceLock::new();
        DEFAULT.get_or_init(|| Arc::new(LoopbackRegistry::new())).clone()
    }

    fn insert(&self, address: PeerAddress, mux: Weak<MuxShared>) {
        self.inner.write().insert(address, mux);
    }

    fn remove(&self, address: &PeerAddress) {
        self.inner.write().remove(address);
    }

    fn get(&self, address: &PeerAddress) -> Option<Arc<MuxShared>> {
        self.inner.read().get(address).and_then(Weak::upgrade)
    }

    /// Whether a live multiplexer is registered for this address
    pub fn contains(&self, address: &PeerAddress) -> bool {
        self.get(address).is_some()
    }
}

pub(crate) struct MuxShared {
    /// Self-reference handed to channels as their parent seam
    self_ref: Weak<MuxShared>,
    identity: Identity,
    config: MuxConfig,
    state: Mutex<MuxState>,
    /// Taken out exactly once on close
    transport: Mutex<Option<Arc<dyn TransportBinding>>>,
    channels: Mutex<HashMap<PeerAddress, VirtualChannel>>,
    registry: Arc<ConnectionRegistry>,
    loopback: Arc<LoopbackRegistry>,
    events: EventSink,
    outbound_tx: Mutex<Option<mpsc::Sender<(SocketAddr, Vec<u8>)>>>,
    handshake_tx: mpsc::UnboundedSender<(SocketAddr, handshake::Message)>,
    handshake_rx: Mutex<Option<mpsc::UnboundedReceiver<(SocketAddr, handshake::Message)>>>,
    dropped_inbound: AtomicU64,
    dropped_outbound: AtomicU64,
    shutdown: broadcast::Sender<()>,
}

impl MuxShared {
    fn address(&self) -> PeerAddress {
        self.identity.address()
    }

    /// Look up or lazily create the channel for a peer
    ///
    /// At most one non-closed channel exists per peer address: a closed
    /// leftover is evicted so a fresh contact gets fresh state.
    fn channel_for(&self, peer: PeerAddress) -> VirtualChannel {
        let mut channels = self.channels.lock();
        if let Some(existing) = channels.get(&peer) {
            if !existing.is_closed() {
                return existing.clone();
            }
            channels.remove(&peer);
        }

        let parent: Weak<dyn ChannelParent> = self.self_ref.clone();
        let channel = VirtualChannel::new(
            self.address(),
            peer,
            parent,
            self.config.channel_high_watermark,
            self.config.channel_low_watermark,
        );
        channels.insert(peer, channel.clone());
        drop(channels);

        channel.activate();
        trace!("channel created for peer {}", peer);
        channel
    }

    /// Queue an inbound payload for a peer, dropping on backpressure
    fn queue_for_peer(&self, sender: PeerAddress, payload: Bytes) -> Option<PeerAddress> {
        let channel = self.channel_for(sender);
        match channel.try_queue_inbound(payload) {
            QueueOutcome::Queued => Some(sender),
            QueueOutcome::Full => {
                // documented loss: never block the demux loop on one peer
                self.dropped_inbound.fetch_add(1, Ordering::Relaxed);
                emit(&self.events, NodeEvent::MessageDropped { peer: sender });
                None
            }
            QueueOutcome::Closed => None,
        }
    }

    /// Deliver a payload arriving over the intra-process shortcut
    fn deliver_local(&self, sender: PeerAddress, payload: Bytes) {
        if *self.state.lock() != MuxState::Active {
            return;
        }
        if let Some(peer) = self.queue_for_peer(sender, payload) {
            let channel = self.channels.lock().get(&peer).cloned();
            if let Some(channel) = channel {
                channel.finish_read();
            }
        }
    }

    fn demux_datagram(&self, data: &[u8], from: SocketAddr, touched: &mut Vec<PeerAddress>) {
        let envelope: Envelope = match postcard::from_bytes(data) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("discarding undecodable datagram from {}: {}", from, e);
                return;
            }
        };
        match envelope {
            Envelope::App(message) => {
                if message.network_id != self.config.network_id {
                    trace!("dropping datagram from another network: {:?}", message.network_id);
                    return;
                }
                if message.recipient != self.address() {
                    self.relay(data, &message);
                    return;
                }
                if let Some(peer) = self.queue_for_peer(message.sender, Bytes::from(message.payload)) {
                    if !touched.contains(&peer) {
                        touched.push(peer);
                    }
                }
            }
            Envelope::Handshake(message) => {
                let _ = self.handshake_tx.send((from, message));
            }
        }
    }

    /// Forward an envelope addressed to another peer on their behalf
    ///
    /// Children reach each other through us when we are their super peer.
    /// Only explicitly installed paths are used, never our own super-peer
    /// fallback, so a message can not bounce between relays.
    fn relay(&self, data: &[u8], message: &AppMessage) {
        let Some(path) = self.registry.known_path(&message.recipient) else {
            trace!("no relay path to {}, dropping", message.recipient);
            self.dropped_inbound.fetch_add(1, Ordering::Relaxed);
            return;
        };
        if let Some(sender) = path.sender() {
            if !sender.deliver(Bytes::copy_from_slice(data)) {
                self.dropped_inbound.fetch_add(1, Ordering::Relaxed);
            }
            return;
        }
        let forwarded = match (path.endpoint(), self.outbound_tx.lock().clone()) {
            (Some(endpoint), Some(tx)) => tx.try_send((endpoint, data.to_vec())).is_ok(),
            _ => false,
        };
        if forwarded {
            trace!("relayed {} -> {}", message.sender, message.recipient);
        } else {
            warn!("relay to {} failed, dropping", message.recipient);
            self.dropped_outbound.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn close_internal(&self) {
        {
            let mut state = self.state.lock();
            if *state == MuxState::Closed {
                return;
            }
            *state = MuxState::Closed;
        }
        debug!("multiplexer {} closing", self.address());

        let _ = self.shutdown.send(());
        self.loopback.remove(&self.address());

        let channels: Vec<VirtualChannel> =
            self.channels.lock().drain().map(|(_, c)| c).collect();
        for channel in channels {
            channel.close(CloseReason::Shutdown);
        }

        self.registry.close_all();
        self.outbound_tx.lock().take();
        if let Some(transport) = self.transport.lock().take() {
            transport.close();
        }
        emit(&self.events, NodeEvent::NodeDown { address: self.address() });
    }
}

#[async_trait]
impl ChannelParent for MuxShared {
    async fn send_app(&self, remote: PeerAddress, payload: Bytes) -> Result<(), ChannelError> {
        if *self.state.lock() != MuxState::Active {
            return Err(ChannelError::ClosedChannel);
        }

        // intra-process shortcut: deliver straight into the peer's channel
        if let Some(target) = self.loopback.get(&remote) {
            target.deliver_local(self.address(), payload);
            return Ok(());
        }

        let path = self
            .registry
            .best_path(&remote)
            .ok_or(ChannelError::PathNotFound(remote))?;

        if let Some(sender) = path.sender() {
            if sender.deliver(payload) {
                return Ok(());
            }
            return Err(ChannelError::PathNotFound(remote));
        }

        let endpoint = path
            .endpoint()
            .ok_or(ChannelError::PathNotFound(remote))?;
        let envelope = Envelope::App(AppMessage {
            network_id: self.config.network_id,
            sender: self.address(),
            recipient: remote,
            payload: payload.to_vec(),
        });
        let bytes = postcard::to_allocvec(&envelope)
            .map_err(|e| ChannelError::Encode(e.to_string()))?;

        let tx = self
            .outbound_tx
            .lock()
            .clone()
            .ok_or(ChannelError::ClosedChannel)?;
        tx.send((endpoint, bytes))
            .await
            .map_err(|_| ChannelError::ClosedChannel)
    }

    fn channel_closed(&self, remote: PeerAddress) {
        let mut channels = self.channels.lock();
        if let Some(channel) = channels.get(&remote) {
            if channel.is_closed() {
                channels.remove(&remote);
            }
        }
    }
}

/// The node-level endpoint multiplexing all virtual channels
#[derive(Clone)]
pub struct Multiplexer {
    shared: Arc<MuxShared>,
}

impl Multiplexer {
    pub fn new(
        identity: Identity,
        config: MuxConfig,
        registry: Arc<ConnectionRegistry>,
        loopback: Arc<LoopbackRegistry>,
        events: EventSink,
    ) -> Self {
        let (handshake_tx, handshake_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = broadcast::channel(1);
        Self {
            shared: Arc::new_cyclic(|self_ref| MuxShared {
                self_ref: self_ref.clone(),
                identity,
                config,
                state: Mutex::new(MuxState::Open),
                transport: Mutex::new(None),
                channels: Mutex::new(HashMap::new()),
                registry,
                loopback,
                events,
                outbound_tx: Mutex::new(None),
                handshake_tx,
                handshake_rx: Mutex::new(Some(handshake_rx)),
                dropped_inbound: AtomicU64::new(0),
                dropped_outbound: AtomicU64::new(0),
                shutdown,
            }),
        }
    }

    /// Bind a UDP transport and start serving
    pub async fn bind(&self, addr: SocketAddr) -> Result<(), MuxError> {
        let transport = UdpBinding::bind(addr).await?;
        self.bind_transport(Arc::new(transport))
    }

    /// Start serving over an already-built transport
    pub fn bind_transport(&self, transport: Arc<dyn TransportBinding>) -> Result<(), MuxError> {
        {
            let mut state = self.shared.state.lock();
            match *state {
                MuxState::Open => *state = MuxState::Active,
                MuxState::Active => return Err(MuxError::AlreadyBound),
                MuxState::Closed => return Err(MuxError::Closed),
            }
        }

        let (outbound_tx, outbound_rx) = mpsc::channel(self.shared.config.outbound_queue);
        *self.shared.outbound_tx.lock() = Some(outbound_tx);
        *self.shared.transport.lock() = Some(transport.clone());
        self.shared
            .loopback
            .insert(self.shared.address(), Arc::downgrade(&self.shared));

        tokio::spawn(run_reader(self.shared.clone(), transport.clone()));
        tokio::spawn(run_writer(self.shared.clone(), transport, outbound_rx));

        debug!("multiplexer {} active", self.shared.address());
        emit(&self.shared.events, NodeEvent::NodeUp { address: self.shared.address() });
        Ok(())
    }

    pub fn state(&self) -> MuxState {
        *self.shared.state.lock()
    }

    pub fn address(&self) -> PeerAddress {
        self.shared.address()
    }

    pub fn identity(&self) -> &Identity {
        &self.shared.identity
    }

    /// Bound transport address, if active
    pub fn local_addr(&self) -> Option<SocketAddr> {
        let transport = self.shared.transport.lock().clone()?;
        transport.local_addr().ok()
    }

    /// Open (or return the existing) channel to a peer
    pub fn open_channel(&self, peer: PeerAddress) -> Result<VirtualChannel, MuxError> {
        if *self.shared.state.lock() != MuxState::Active {
            return Err(MuxError::NotActive);
        }
        Ok(self.shared.channel_for(peer))
    }

    /// Look up an existing channel without creating one
    pub fn channel(&self, peer: &PeerAddress) -> Option<VirtualChannel> {
        self.shared.channels.lock().get(peer).cloned()
    }

    pub fn channel_count(&self) -> usize {
        self.shared.channels.lock().len()
    }

    /// Feed one already-demultiplexed datagram into the endpoint
    ///
    /// Entry point for the native engine driver, which receives
    /// `(senderAddress, payload)` pairs instead of raw socket datagrams.
    pub fn inject_inbound(&self, sender: PeerAddress, payload: Bytes) {
        self.shared.deliver_local(sender, payload);
    }

    /// Take the inbound handshake message stream; available once
    pub fn take_handshake_rx(
        &self,
    ) -> Option<mpsc::UnboundedReceiver<(SocketAddr, handshake::Message)>> {
        self.shared.handshake_rx.lock().take()
    }

    /// Send a handshake message to a raw endpoint, bypassing peer lookup
    pub fn send_handshake(&self, endpoint: SocketAddr, message: handshake::Message) -> Result<(), MuxError> {
        let envelope = Envelope::Handshake(message);
        let bytes =
            postcard::to_allocvec(&envelope).map_err(|e| MuxError::Encode(e.to_string()))?;
        let tx = self.shared.outbound_tx.lock().clone().ok_or(MuxError::NotActive)?;
        if tx.try_send((endpoint, bytes)).is_err() {
            self.shared.dropped_outbound.fetch_add(1, Ordering::Relaxed);
            warn!("outbound queue full, handshake message to {} dropped", endpoint);
        }
        Ok(())
    }

    /// Messages dropped inbound due to channel backpressure
    pub fn dropped_inbound(&self) -> u64 {
        self.shared.dropped_inbound.load(Ordering::Relaxed)
    }

    /// Close the endpoint and every channel under it; idempotent
    pub fn close(&self) {
        self.shared.close_internal();
    }
}

impl handshake::WireSender for Multiplexer {
    fn send_message(&self, endpoint: SocketAddr, message: handshake::Message) {
        if let Err(e) = self.send_handshake(endpoint, message) {
            warn!("handshake send to {} failed: {}", endpoint, e);
        }
    }
}

/// Receive loop: drain the transport in budgeted batches and signal read
/// completion once per touched peer
async fn run_reader(shared: Arc<MuxShared>, transport: Arc<dyn TransportBinding>) {
    let mut shutdown_rx = shared.shutdown.subscribe();
    let mut buf = vec![0u8; transport.mtu()];

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            ready = transport.readable() => {
                match ready {
                    Ok(()) => {}
                    Err(TransportError::Closed) => break,
                    Err(e) => {
                        error!("fatal receive error, closing endpoint: {}", e);
                        shared.close_internal();
                        break;
                    }
                }
                if let Err(e) = drain_batch(&shared, &transport, &mut buf) {
                    error!("fatal receive error, closing endpoint: {}", e);
                    shared.close_internal();
                    break;
                }
            }
        }
    }
}

fn drain_batch(
    shared: &Arc<MuxShared>,
    transport: &Arc<dyn TransportBinding>,
    buf: &mut [u8],
) -> Result<(), TransportError> {
    let mut touched: Vec<PeerAddress> = Vec::new();

    for _ in 0..shared.config.read_budget {
        match transport.try_recv_from(buf) {
            Ok(Some((len, from))) => {
                shared.demux_datagram(&buf[..len], from, &mut touched);
            }
            Ok(None) => break,
            Err(TransportError::Closed) => break,
            Err(e) => return Err(e),
        }
    }

    // one read-complete signal per distinct peer in the batch
    for peer in touched {
        let channel = shared.channels.lock().get(&peer).cloned();
        if let Some(channel) = channel {
            channel.finish_read();
        }
    }
    Ok(())
}

/// Write loop: drain the outbound queue onto the transport, pausing on
/// physical backpressure until writability returns
async fn run_writer(
    shared: Arc<MuxShared>,
    transport: Arc<dyn TransportBinding>,
    mut outbound_rx: mpsc::Receiver<(SocketAddr, Vec<u8>)>,
) {
    let mut shutdown_rx = shared.shutdown.subscribe();

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            item = outbound_rx.recv() => {
                let Some((endpoint, bytes)) = item else { break };
                loop {
                    match transport.try_send_to(&bytes, endpoint) {
                        Ok(()) => break,
                        Err(TransportError::NotWritable) => {
                            if transport.writable().await.is_err() {
                                return;
                            }
                        }
                        Err(TransportError::Closed) => return,
                        Err(e) => {
                            // per-write failure: drop this message, stay open
                            warn!("send to {} failed: {}", endpoint, e);
                            shared.dropped_outbound.fetch_add(1, Ordering::Relaxed);
                            break;
                        }
                    }
                }
            }
        }
    }
}
