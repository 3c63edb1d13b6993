//! Join/welcome handshake
//!
//! Session establishment between a node and a (super) peer. The initiator
//! sends a join carrying its proof of work; the responder validates it,
//! answers with a welcome, and installs a direct path once the initiator
//! confirms. Failed attempts are retried on a configurable schedule,
//! rotating through the configured endpoints.

use crate::event::{emit, EventSink, NodeEvent};
use crate::registry::{ConnectionRegistry, PathHandle, PathKind};
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};
use weft_core::{Identity, NetworkId, PeerAddress, ProofOfWork};

/// Why a join was refused
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    /// Proof of work does not satisfy the required difficulty
    ProofOfWorkInvalid,
    /// This node does not accept children
    NotASuperPeer,
    /// Join claims our own address
    IdentityCollision,
    /// Join belongs to a different overlay network
    OtherNetwork,
}

/// Request to open a session
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Join {
    pub network_id: NetworkId,
    pub sender: PeerAddress,
    pub proof_of_work: ProofOfWork,
    /// Set when the join targets a specific super peer
    pub recipient: Option<PeerAddress>,
    /// Present when the sender wants to register as our child
    pub join_as_child_time: Option<u64>,
    pub correlation_id: u64,
}

/// Positive answer to a join
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Welcome {
    pub network_id: NetworkId,
    pub sender: PeerAddress,
    pub proof_of_work: ProofOfWork,
    pub correlation_id: u64,
    /// Further endpoints of the responder the initiator may try
    pub endpoints: Vec<SocketAddr>,
}

/// Initiator acknowledgement completing the exchange
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Confirm {
    pub correlation_id: u64,
}

/// Negative answer to a join
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reject {
    pub correlation_id: u64,
    pub reason: RejectReason,
}

/// Handshake wire messages
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    Join(Join),
    Welcome(Welcome),
    Confirm(Confirm),
    Reject(Reject),
}

/// Handshake errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("handshake timed out")]
    Timeout,
    #[error("join rejected: {0:?}")]
    Rejected(RejectReason),
    #[error("welcome failed validation")]
    InvalidWelcome,
    #[error("no endpoints to connect to")]
    NoEndpoints,
    #[error("node closed")]
    NodeClosed,
}

/// Retry delays for failed connect attempts
///
/// The delays are walked in order; once exhausted the last delay repeats
/// indefinitely. An empty schedule means a single attempt with no retry.
#[derive(Clone, Debug, Default)]
pub struct RetrySchedule {
    delays: Vec<Duration>,
}

impl RetrySchedule {
    pub fn new(delays: Vec<Duration>) -> Self {
        Self { delays }
    }

    pub fn from_millis(millis: &[u64]) -> Self {
        Self::new(millis.iter().map(|m| Duration::from_millis(*m)).collect())
    }

    /// Delay before retry number `attempt` (zero-based), `None` when the
    /// schedule is empty
    pub fn delay(&self, attempt: usize) -> Option<Duration> {
        if self.delays.is_empty() {
            return None;
        }
        Some(self.delays[attempt.min(self.delays.len() - 1)])
    }
}

/// Round-robin walk over a fixed endpoint list
struct EndpointCycle {
    endpoints: Vec<SocketAddr>,
    index: usize,
}

impl EndpointCycle {
    fn new(endpoints: Vec<SocketAddr>) -> Self {
        Self { endpoints, index: 0 }
    }

    /// Next endpoint; advances together with the retry delay pointer
    fn next(&mut self) -> SocketAddr {
        let endpoint = self.endpoints[self.index];
        self.index = (self.index + 1) % self.endpoints.len();
        endpoint
    }
}

/// How this node answers and issues joins
#[derive(Clone, Debug)]
pub struct HandshakeConfig {
    pub network_id: NetworkId,
    /// Difficulty every peer's proof of work must satisfy
    pub min_pow_difficulty: u8,
    /// Whether this node accepts join-as-child requests
    pub is_super_peer: bool,
    /// Per-attempt timeout
    pub timeout: Duration,
    pub retry: RetrySchedule,
    /// Endpoints advertised in our welcome messages
    pub advertised_endpoints: Vec<SocketAddr>,
}

impl HandshakeConfig {
    pub fn new(network_id: NetworkId) -> Self {
        Self {
            network_id,
            min_pow_difficulty: 24,
            is_super_peer: false,
            timeout: Duration::from_secs(5),
            retry: RetrySchedule::from_millis(&[500, 1_000, 2_000, 5_000]),
            advertised_endpoints: Vec::new(),
        }
    }
}

/// Validate an inbound join
///
/// Checks run in a fixed order so a message failing several of them is
/// always refused for the same reason: proof of work first, then super-peer
/// capability, identity collision, and network membership.
pub fn validate_join(
    join: &Join,
    own_address: &PeerAddress,
    network_id: NetworkId,
    is_super_peer: bool,
    min_pow_difficulty: u8,
) -> Result<(), RejectReason> {
    if !join.proof_of_work.is_valid(&join.sender, min_pow_difficulty) {
        return Err(RejectReason::ProofOfWorkInvalid);
    }
    if join.join_as_child_time.is_some() && !is_super_peer {
        return Err(RejectReason::NotASuperPeer);
    }
    if join.sender == *own_address {
        return Err(RejectReason::IdentityCollision);
    }
    if join.network_id != network_id {
        return Err(RejectReason::OtherNetwork);
    }
    Ok(())
}

/// Outbound side of the wire, implemented by the multiplexer
pub trait WireSender: Send + Sync {
    /// Fire-and-forget send of a handshake message to a raw endpoint
    fn send_message(&self, endpoint: SocketAddr, message: Message);
}

/// An established session as seen by the initiator
#[derive(Clone, Debug)]
pub struct SessionInfo {
    pub peer: PeerAddress,
    pub endpoint: SocketAddr,
    /// Further endpoints the peer advertised
    pub remote_endpoints: Vec<SocketAddr>,
}

/// A welcome sent, waiting for the initiator's confirm
///
/// Offers outlive their usefulness after the per-attempt timeout; stale ones
/// are swept on the next join and refused on a late confirm.
struct PendingOffer {
    peer: PeerAddress,
    endpoint: SocketAddr,
    created: tokio::time::Instant,
}

impl PendingOffer {
    fn expired(&self, timeout: Duration) -> bool {
        self.created.elapsed() > timeout
    }
}

type AttemptResult = Result<Welcome, HandshakeError>;

/// Drives the join/welcome exchange on both sides
pub struct HandshakeService {
    config: HandshakeConfig,
    address: PeerAddress,
    proof_of_work: ProofOfWork,
    registry: Arc<ConnectionRegistry>,
    events: EventSink,
    wire: Arc<dyn WireSender>,
    /// Joins we sent, keyed by correlation id
    pending: Mutex<HashMap<u64, oneshot::Sender<AttemptResult>>>,
    /// Welcomes we sent, keyed by correlation id
    offers: Mutex<HashMap<u64, PendingOffer>>,
    open: AtomicBool,
}

impl HandshakeService {
    pub fn new(
        identity: &Identity,
        config: HandshakeConfig,
        registry: Arc<ConnectionRegistry>,
        events: EventSink,
        wire: Arc<dyn WireSender>,
    ) -> Self {
        Self {
            config,
            address: identity.address(),
            proof_of_work: identity.proof_of_work(),
            registry,
            events,
            wire,
            pending: Mutex::new(HashMap::new()),
            offers: Mutex::new(HashMap::new()),
            open: AtomicBool::new(true),
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Stop the service; in-flight connect attempts resolve with `NodeClosed`
    pub fn close(&self) {
        self.open.store(false, Ordering::Release);
        self.offers.lock().clear();
        let pending: Vec<_> = self.pending.lock().drain().collect();
        for (_, tx) in pending {
            let _ = tx.send(Err(HandshakeError::NodeClosed));
        }
    }

    /// Handle one inbound handshake message
    pub fn handle_message(&self, from: SocketAddr, message: Message) {
        match message {
            Message::Join(join) => self.handle_join(from, join),
            Message::Welcome(welcome) => self.handle_welcome(welcome),
            Message::Confirm(confirm) => self.handle_confirm(confirm),
            Message::Reject(reject) => self.handle_reject(reject),
        }
    }

    fn handle_join(&self, from: SocketAddr, join: Join) {
        if !self.is_open() {
            return;
        }
        if let Err(reason) = validate_join(
            &join,
            &self.address,
            self.config.network_id,
            self.config.is_super_peer,
            self.config.min_pow_difficulty,
        ) {
            debug!("refusing join from {}: {:?}", join.sender, reason);
            self.wire.send_message(
                from,
                Message::Reject(Reject {
                    correlation_id: join.correlation_id,
                    reason,
                }),
            );
            return;
        }

        trace!("welcoming {} at {}", join.sender, from);
        {
            let mut offers = self.offers.lock();
            offers.retain(|_, offer| !offer.expired(self.config.timeout));
            offers.insert(
                join.correlation_id,
                PendingOffer {
                    peer: join.sender,
                    endpoint: from,
                    created: tokio::time::Instant::now(),
                },
            );
        }
        self.wire.send_message(
            from,
            Message::Welcome(Welcome {
                network_id: self.config.network_id,
                sender: self.address,
                proof_of_work: self.proof_of_work,
                correlation_id: join.correlation_id,
                endpoints: self.config.advertised_endpoints.clone(),
            }),
        );
    }

    fn handle_confirm(&self, confirm: Confirm) {
        let Some(offer) = self.offers.lock().remove(&confirm.correlation_id) else {
            trace!("ignoring confirm with unknown correlation id");
            return;
        };
        if offer.expired(self.config.timeout) {
            debug!("ignoring confirm for expired offer from {}", offer.peer);
            return;
        }
        self.install_path(offer.peer, offer.endpoint);
        debug!("session established with {} at {}", offer.peer, offer.endpoint);
        emit(&self.events, NodeEvent::PeerOnline { peer: offer.peer });
    }

    fn handle_welcome(&self, welcome: Welcome) {
        let Some(tx) = self.pending.lock().remove(&welcome.correlation_id) else {
            trace!("ignoring welcome with unknown correlation id");
            return;
        };
        let result = if welcome
            .proof_of_work
            .is_valid(&welcome.sender, self.config.min_pow_difficulty)
        {
            Ok(welcome)
        } else {
            Err(HandshakeError::InvalidWelcome)
        };
        let _ = tx.send(result);
    }

    fn handle_reject(&self, reject: Reject) {
        if let Some(tx) = self.pending.lock().remove(&reject.correlation_id) {
            let _ = tx.send(Err(HandshakeError::Rejected(reject.reason)));
        }
    }

    /// Install a direct-session path for a peer with self-removing cleanup
    fn install_path(&self, peer: PeerAddress, endpoint: SocketAddr) {
        let path = PathHandle::direct(PathKind::DirectSession, endpoint);
        let id = path.id();
        let registry = self.registry.clone();
        let path = path.on_close(move |_| {
            registry.remove_path(&peer, id);
        });
        self.registry.add_path(peer, path);
    }

    /// Connect to a peer, retrying per schedule and rotating endpoints
    ///
    /// `expected` pins the remote identity; a welcome from anyone else fails
    /// the attempt. `should_retry` is consulted before each retry, letting
    /// the caller cancel a long-running reconnect loop.
    pub async fn connect(
        &self,
        expected: Option<PeerAddress>,
        endpoints: Vec<SocketAddr>,
        join_as_child: bool,
        should_retry: impl Fn() -> bool,
    ) -> Result<SessionInfo, HandshakeError> {
        if endpoints.is_empty() {
            return Err(HandshakeError::NoEndpoints);
        }
        let mut cycle = EndpointCycle::new(endpoints);
        let mut attempt = 0usize;

        loop {
            let endpoint = cycle.next();
            match self.attempt(expected, endpoint, join_as_child).await {
                Ok(info) => return Ok(info),
                Err(err) => {
                    let Some(delay) = self.config.retry.delay(attempt) else {
                        return Err(err);
                    };
                    if !self.is_open() {
                        return Err(HandshakeError::NodeClosed);
                    }
                    if !should_retry() {
                        return Err(err);
                    }
                    debug!(
                        "handshake with {} failed ({}), retrying in {:?}",
                        endpoint, err, delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// One join/welcome/confirm round against a single endpoint
    async fn attempt(
        &self,
        expected: Option<PeerAddress>,
        endpoint: SocketAddr,
        join_as_child: bool,
    ) -> Result<SessionInfo, HandshakeError> {
        if !self.is_open() {
            return Err(HandshakeError::NodeClosed);
        }
        let correlation_id = rand::thread_rng().gen::<u64>();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(correlation_id, tx);

        self.wire.send_message(
            endpoint,
            Message::Join(Join {
                network_id: self.config.network_id,
                sender: self.address,
                proof_of_work: self.proof_of_work,
                recipient: expected,
                join_as_child_time: join_as_child.then(now_millis),
                correlation_id,
            }),
        );

        let outcome = tokio::time::timeout(self.config.timeout, rx).await;
        // a late answer after this point finds no pending entry and is ignored
        self.pending.lock().remove(&correlation_id);

        let welcome = match outcome {
            Err(_) => return Err(HandshakeError::Timeout),
            Ok(Err(_)) => return Err(HandshakeError::NodeClosed),
            Ok(Ok(Err(err))) => return Err(err),
            Ok(Ok(Ok(welcome))) => welcome,
        };

        if let Some(expected) = expected {
            if welcome.sender != expected {
                warn!("welcome from unexpected peer {}", welcome.sender);
                return Err(HandshakeError::InvalidWelcome);
            }
        }

        self.wire
            .send_message(endpoint, Message::Confirm(Confirm { correlation_id }));
        self.install_path(welcome.sender, endpoint);
        if join_as_child {
            self.registry.set_super_peer(welcome.sender);
        }
        debug!("joined {} at {}", welcome.sender, endpoint);
        emit(&self.events, NodeEvent::PeerOnline { peer: welcome.sender });

        Ok(SessionInfo {
            peer: welcome.sender,
            endpoint,
            remote_endpoints: welcome.endpoints,
        })
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::event_channel;
    use parking_lot::RwLock;
    use std::sync::atomic::AtomicUsize;

    const DIFFICULTY: u8 = 8;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    fn identity(seed: u8) -> Identity {
        let unproven = Identity::from_seed(&[seed; 32], ProofOfWork(0));
        let pow = ProofOfWork::generate(&unproven.address(), DIFFICULTY);
        Identity::from_seed(&[seed; 32], pow)
    }

    fn join_from(identity: &Identity, network_id: NetworkId, as_child: bool) -> Join {
        Join {
            network_id,
            sender: identity.address(),
            proof_of_work: identity.proof_of_work(),
            recipient: None,
            join_as_child_time: as_child.then(|| 1u64),
            correlation_id: 7,
        }
    }

    #[test]
    fn test_validate_join_accepts_valid() {
        let me = identity(1);
        let peer = identity(2);
        let join = join_from(&peer, NetworkId(1), true);
        assert_eq!(
            validate_join(&join, &me.address(), NetworkId(1), true, DIFFICULTY),
            Ok(())
        );
    }

    #[test]
    fn test_validate_join_rejection_order() {
        let me = identity(1);
        let peer = identity(2);

        // invalid pow plus wrong network: pow wins, it is checked first
        let mut join = join_from(&peer, NetworkId(2), false);
        join.proof_of_work = ProofOfWork(-1);
        let verdict = validate_join(&join, &me.address(), NetworkId(1), true, 64);
        assert_eq!(verdict, Err(RejectReason::ProofOfWorkInvalid));

        // join-as-child against a non-super-peer, before network check
        let join = join_from(&peer, NetworkId(2), true);
        let verdict = validate_join(&join, &me.address(), NetworkId(1), false, DIFFICULTY);
        assert_eq!(verdict, Err(RejectReason::NotASuperPeer));

        // identity collision before network check
        let join = join_from(&me, NetworkId(2), false);
        let verdict = validate_join(&join, &me.address(), NetworkId(1), true, DIFFICULTY);
        assert_eq!(verdict, Err(RejectReason::IdentityCollision));

        // only the network left to complain about
        let join = join_from(&peer, NetworkId(2), false);
        let verdict = validate_join(&join, &me.address(), NetworkId(1), true, DIFFICULTY);
        assert_eq!(verdict, Err(RejectReason::OtherNetwork));
    }

    #[test]
    fn test_retry_schedule_last_delay_repeats() {
        let schedule = RetrySchedule::from_millis(&[100, 500]);
        assert_eq!(schedule.delay(0), Some(Duration::from_millis(100)));
        assert_eq!(schedule.delay(1), Some(Duration::from_millis(500)));
        assert_eq!(schedule.delay(2), Some(Duration::from_millis(500)));
        assert_eq!(schedule.delay(99), Some(Duration::from_millis(500)));
    }

    #[test]
    fn test_empty_retry_schedule_means_no_retry() {
        let schedule = RetrySchedule::default();
        assert_eq!(schedule.delay(0), None);
    }

    #[test]
    fn test_endpoint_cycle_wraps() {
        let mut cycle = EndpointCycle::new(vec![addr(1), addr(2), addr(3)]);
        assert_eq!(cycle.next(), addr(1));
        assert_eq!(cycle.next(), addr(2));
        assert_eq!(cycle.next(), addr(3));
        assert_eq!(cycle.next(), addr(1));
    }

    /// In-memory wire connecting services by endpoint
    #[derive(Default)]
    struct Switchboard {
        services: RwLock<HashMap<SocketAddr, Arc<HandshakeService>>>,
    }

    struct Port {
        board: Arc<Switchboard>,
        endpoint: SocketAddr,
    }

    impl WireSender for Port {
        fn send_message(&self, endpoint: SocketAddr, message: Message) {
            let target = self.board.services.read().get(&endpoint).cloned();
            if let Some(target) = target {
                target.handle_message(self.endpoint, message);
            }
        }
    }

    /// Wire that drops everything
    struct BlackHole;

    impl WireSender for BlackHole {
        fn send_message(&self, _endpoint: SocketAddr, _message: Message) {}
    }

    fn service(
        seed: u8,
        endpoint: SocketAddr,
        board: &Arc<Switchboard>,
        configure: impl FnOnce(&mut HandshakeConfig),
    ) -> (
        Arc<HandshakeService>,
        Arc<ConnectionRegistry>,
        tokio::sync::mpsc::UnboundedReceiver<NodeEvent>,
    ) {
        let identity = identity(seed);
        let (events, rx) = event_channel();
        let registry = Arc::new(ConnectionRegistry::new(events.clone()));
        let mut config = HandshakeConfig::new(NetworkId(1));
        config.min_pow_difficulty = DIFFICULTY;
        config.retry = RetrySchedule::default();
        configure(&mut config);
        let wire = Arc::new(Port {
            board: board.clone(),
            endpoint,
        });
        let service = Arc::new(HandshakeService::new(
            &identity,
            config,
            registry.clone(),
            events,
            wire,
        ));
        board.services.write().insert(endpoint, service.clone());
        (service, registry, rx)
    }

    #[tokio::test]
    async fn test_connect_establishes_session_on_both_sides() {
        let board = Arc::new(Switchboard::default());
        let (initiator, init_registry, _init_rx) = service(1, addr(1001), &board, |_| {});
        let (responder, resp_registry, mut resp_rx) = service(2, addr(1002), &board, |c| {
            c.is_super_peer = true;
            c.advertised_endpoints = vec![addr(1002)];
        });

        let info = initiator
            .connect(Some(responder.address), vec![addr(1002)], true, || true)
            .await
            .unwrap();

        assert_eq!(info.peer, responder.address);
        assert_eq!(info.endpoint, addr(1002));
        assert_eq!(info.remote_endpoints, vec![addr(1002)]);

        // initiator installed a direct path and adopted the super peer
        let best = init_registry.best_path(&responder.address).unwrap();
        assert_eq!(best.kind(), PathKind::DirectSession);
        assert_eq!(best.endpoint(), Some(addr(1002)));
        assert_eq!(init_registry.super_peer(), Some(responder.address));

        // responder installed the reverse path on confirm
        let back = resp_registry.best_path(&initiator.address).unwrap();
        assert_eq!(back.endpoint(), Some(addr(1001)));
        assert_eq!(
            resp_rx.try_recv().unwrap(),
            NodeEvent::PeerOnline { peer: initiator.address }
        );
    }

    #[tokio::test]
    async fn test_connect_reports_rejection() {
        let board = Arc::new(Switchboard::default());
        let (initiator, _reg, _rx) = service(1, addr(1101), &board, |_| {});
        // responder on another network
        let (_responder, _reg2, _rx2) = service(2, addr(1102), &board, |c| {
            c.network_id = NetworkId(99);
        });

        let err = initiator
            .connect(None, vec![addr(1102)], false, || true)
            .await
            .unwrap_err();
        assert_eq!(err, HandshakeError::Rejected(RejectReason::OtherNetwork));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_times_out_without_answer() {
        let identity = identity(1);
        let (events, _rx) = event_channel();
        let registry = Arc::new(ConnectionRegistry::new(events.clone()));
        let mut config = HandshakeConfig::new(NetworkId(1));
        config.timeout = Duration::from_millis(50);
        config.retry = RetrySchedule::default();
        let service =
            HandshakeService::new(&identity, config, registry, events, Arc::new(BlackHole));

        let err = service
            .connect(None, vec![addr(1201)], false, || true)
            .await
            .unwrap_err();
        assert_eq!(err, HandshakeError::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_retries_until_caller_gives_up() {
        let identity = identity(1);
        let (events, _rx) = event_channel();
        let registry = Arc::new(ConnectionRegistry::new(events.clone()));
        let mut config = HandshakeConfig::new(NetworkId(1));
        config.timeout = Duration::from_millis(10);
        config.retry = RetrySchedule::from_millis(&[10, 20]);
        let service =
            HandshakeService::new(&identity, config, registry, events, Arc::new(BlackHole));

        let consulted = AtomicUsize::new(0);
        let err = service
            .connect(None, vec![addr(1301), addr(1302)], false, || {
                consulted.fetch_add(1, Ordering::SeqCst) < 2
            })
            .await
            .unwrap_err();

        assert_eq!(err, HandshakeError::Timeout);
        // two retries granted, third refusal ends the loop
        assert_eq!(consulted.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unconfirmed_offer_expires() {
        let local_identity = identity(1);
        let (events, mut rx) = event_channel();
        let registry = Arc::new(ConnectionRegistry::new(events.clone()));
        let mut config = HandshakeConfig::new(NetworkId(1));
        config.min_pow_difficulty = DIFFICULTY;
        config.is_super_peer = true;
        config.timeout = Duration::from_millis(50);
        let service = HandshakeService::new(
            &local_identity,
            config,
            registry.clone(),
            events,
            Arc::new(BlackHole),
        );

        let child = identity(2);
        let join = join_from(&child, NetworkId(1), true);
        service.handle_message(addr(1501), Message::Join(join));

        // the confirm arrives long after the per-attempt timeout
        tokio::time::advance(Duration::from_millis(100)).await;
        service.handle_message(addr(1501), Message::Confirm(Confirm { correlation_id: 7 }));

        assert!(registry.best_path(&child.address()).is_none());
        assert!(rx.try_recv().is_err());
        assert!(service.offers.lock().is_empty());

        // a later join sweeps stale offers out of the map
        let other = identity(3);
        let mut stale = join_from(&other, NetworkId(1), true);
        stale.correlation_id = 8;
        service.handle_message(addr(1502), Message::Join(stale));
        tokio::time::advance(Duration::from_millis(100)).await;
        let fresh = join_from(&child, NetworkId(1), true);
        service.handle_message(addr(1501), Message::Join(fresh));
        let offers = service.offers.lock();
        assert_eq!(offers.len(), 1);
        assert!(offers.contains_key(&7));
    }

    #[tokio::test]
    async fn test_close_fails_pending_attempts() {
        let identity = identity(1);
        let (events, _rx) = event_channel();
        let registry = Arc::new(ConnectionRegistry::new(events.clone()));
        let mut config = HandshakeConfig::new(NetworkId(1));
        config.timeout = Duration::from_secs(60);
        config.retry = RetrySchedule::default();
        let service = Arc::new(HandshakeService::new(
            &identity,
            config,
            registry,
            events,
            Arc::new(BlackHole),
        ));

        let connecting = {
            let service = service.clone();
            tokio::spawn(async move {
                service.connect(None, vec![addr(1401)], false, || true).await
            })
        };
        tokio::task::yield_now().await;
        service.close();

        let err = connecting.await.unwrap().unwrap_err();
        assert_eq!(err, HandshakeError::NodeClosed);
    }
}
